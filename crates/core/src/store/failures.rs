use sqlx::SqlitePool;

use crate::types::Failure;

/// One failed step, already reduced to its pattern key.
#[derive(Debug, Clone)]
pub struct FailureSample {
    pub pattern: String,
    pub example: String,
    pub error: String,
}

const SELECT: &str = "SELECT id, command_pattern, command_example, error_message, count FROM failures";

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: i64,
    command_pattern: String,
    command_example: String,
    error_message: String,
    count: i64,
}

impl From<FailureRow> for Failure {
    fn from(row: FailureRow) -> Self {
        Self {
            id: row.id,
            command_pattern: row.command_pattern,
            command_example: row.command_example,
            error_message: row.error_message,
            count: row.count,
        }
    }
}

/// Upsert a batch of samples in one transaction. An existing pattern gets
/// its count bumped and its example/error refreshed; the key never changes.
pub async fn upsert(pool: &SqlitePool, samples: &[FailureSample]) -> Result<(), sqlx::Error> {
    if samples.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for s in samples {
        sqlx::query(
            "INSERT INTO failures (command_pattern, command_example, error_message, count) \
             VALUES (?, ?, ?, 1) \
             ON CONFLICT (command_pattern) DO UPDATE SET \
               count = count + 1, \
               command_example = excluded.command_example, \
               error_message = excluded.error_message, \
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&s.pattern)
        .bind(&s.example)
        .bind(&s.error)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Highest-count failure; ties go to the most recently updated.
pub async fn top(pool: &SqlitePool) -> Result<Option<Failure>, sqlx::Error> {
    let row: Option<FailureRow> =
        sqlx::query_as(&format!("{SELECT} ORDER BY count DESC, updated_at DESC, id DESC LIMIT 1"))
            .fetch_optional(pool)
            .await?;
    Ok(row.map(Into::into))
}

/// Most recently updated first.
pub async fn recent(pool: &SqlitePool, n: i64) -> Result<Vec<Failure>, sqlx::Error> {
    let rows: Vec<FailureRow> =
        sqlx::query_as(&format!("{SELECT} ORDER BY updated_at DESC, id DESC LIMIT ?"))
            .bind(n)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn all(pool: &SqlitePool) -> Result<Vec<Failure>, sqlx::Error> {
    let rows: Vec<FailureRow> = sqlx::query_as(&format!("{SELECT} ORDER BY id"))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pattern: &str, error: &str) -> FailureSample {
        FailureSample { pattern: pattern.into(), example: format!("{pattern} x"), error: error.into() }
    }

    #[tokio::test]
    async fn same_pattern_increments_one_row() {
        let pool = crate::store::in_memory().await.unwrap();
        upsert(&pool, &[sample("curl", "first"), sample("curl", "second")]).await.unwrap();
        upsert(&pool, &[sample("wget", "nope")]).await.unwrap();

        let rows = all(&pool).await.unwrap();
        assert_eq!(rows.len(), 2);
        let top = top(&pool).await.unwrap().unwrap();
        assert_eq!(top.command_pattern, "curl");
        assert_eq!(top.count, 2);
        assert_eq!(top.error_message, "second");
    }
}
