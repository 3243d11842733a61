use sqlx::SqlitePool;

/// Read one value from the `system_state` key/value table.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM system_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

/// Insert or overwrite one value.
pub async fn put(pool: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO system_state (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a value only if the key is absent.
pub async fn put_if_absent(pool: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO system_state (key, value) VALUES (?, ?) ON CONFLICT (key) DO NOTHING")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

/// All `(key, value)` pairs whose key starts with `prefix`.
pub async fn list_prefix(pool: &SqlitePool, prefix: &str) -> Result<Vec<(String, String)>, sqlx::Error> {
    sqlx::query_as("SELECT key, value FROM system_state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
        .bind(prefix)
        .fetch_all(pool)
        .await
}

/// Delete every key starting with any of `prefixes`, in one transaction.
pub async fn delete_prefixes(pool: &SqlitePool, prefixes: &[&str]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut removed = 0;
    for prefix in prefixes {
        removed += sqlx::query("DELETE FROM system_state WHERE substr(key, 1, length(?1)) = ?1")
            .bind(*prefix)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_prefix_ops() {
        let pool = crate::store::in_memory().await.unwrap();
        put(&pool, "model_quota_a", "1").await.unwrap();
        put(&pool, "model_quota_a", "2").await.unwrap();
        put(&pool, "model_exhausted_b", "x").await.unwrap();
        put(&pool, "cfg.k", "v").await.unwrap();
        put_if_absent(&pool, "cfg.k", "other").await.unwrap();

        assert_eq!(get(&pool, "model_quota_a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(get(&pool, "cfg.k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(list_prefix(&pool, "model_").await.unwrap().len(), 2);

        let removed = delete_prefixes(&pool, &["model_quota_", "model_exhausted_"]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(list_prefix(&pool, "model_").await.unwrap().is_empty());
        assert!(get(&pool, "cfg.k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prefix_match_is_literal() {
        let pool = crate::store::in_memory().await.unwrap();
        put(&pool, "model_x", "1").await.unwrap();
        put(&pool, "modelAx", "1").await.unwrap();
        // `_` is a LIKE wildcard; prefix matching must not treat it as one.
        assert_eq!(list_prefix(&pool, "model_").await.unwrap().len(), 1);
    }
}
