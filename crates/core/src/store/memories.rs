use sqlx::SqlitePool;

use crate::types::{Memory, MemoryKind};

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: i64,
    kind: String,
    content: String,
    loop_id: Option<i64>,
}

impl From<MemoryRow> for Memory {
    fn from(row: MemoryRow) -> Self {
        Self {
            id: row.id,
            kind: MemoryKind::from_db(&row.kind).unwrap_or(MemoryKind::Observation),
            content: row.content,
            loop_id: row.loop_id,
        }
    }
}

pub async fn insert(
    pool: &SqlitePool,
    kind: MemoryKind,
    content: &str,
    loop_id: Option<i64>,
) -> Result<i64, sqlx::Error> {
    let id = sqlx::query("INSERT INTO memories (kind, content, loop_id) VALUES (?, ?, ?)")
        .bind(kind.as_db_str())
        .bind(content)
        .bind(loop_id)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Memories eligible for compression (everything but compressed lessons).
pub async fn count_uncompressed(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memories WHERE kind != 'compressed_lesson'")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn oldest_uncompressed(pool: &SqlitePool, n: i64) -> Result<Vec<Memory>, sqlx::Error> {
    let rows: Vec<MemoryRow> = sqlx::query_as(
        "SELECT id, kind, content, loop_id FROM memories \
         WHERE kind != 'compressed_lesson' ORDER BY id ASC LIMIT ?",
    )
    .bind(n)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Newest first, any kind.
pub async fn recent(pool: &SqlitePool, n: i64) -> Result<Vec<Memory>, sqlx::Error> {
    let rows: Vec<MemoryRow> =
        sqlx::query_as("SELECT id, kind, content, loop_id FROM memories ORDER BY id DESC LIMIT ?")
            .bind(n)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Delete `ids` and insert one compressed lesson in their place, atomically.
pub async fn replace_with_lesson(pool: &SqlitePool, ids: &[i64], lesson: &str) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("DELETE FROM memories WHERE id = ? AND kind != 'compressed_lesson'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    let lesson_id = sqlx::query("INSERT INTO memories (kind, content) VALUES (?, ?)")
        .bind(MemoryKind::CompressedLesson.as_db_str())
        .bind(lesson)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
    tx.commit().await?;
    Ok(lesson_id)
}

pub async fn count_by_kind(pool: &SqlitePool, kind: MemoryKind) -> Result<i64, sqlx::Error> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memories WHERE kind = ?")
        .bind(kind.as_db_str())
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lessons_are_never_selected_for_compression() {
        let pool = crate::store::in_memory().await.unwrap();
        let a = insert(&pool, MemoryKind::Reflection, "a", None).await.unwrap();
        let b = insert(&pool, MemoryKind::Observation, "b", None).await.unwrap();
        replace_with_lesson(&pool, &[a, b], "ab").await.unwrap();
        insert(&pool, MemoryKind::Observation, "c", None).await.unwrap();

        assert_eq!(count_uncompressed(&pool).await.unwrap(), 1);
        let oldest = oldest_uncompressed(&pool, 10).await.unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].content, "c");

        let recent = recent(&pool, 5).await.unwrap();
        assert_eq!(recent[0].content, "c");
        assert_eq!(recent[1].kind, MemoryKind::CompressedLesson);
    }
}
