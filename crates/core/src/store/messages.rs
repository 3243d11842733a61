use sqlx::SqlitePool;

use crate::types::{Message, MessageSource};

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    source: String,
    content: String,
    is_read: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            source: MessageSource::from_db(&row.source).unwrap_or(MessageSource::Human),
            content: row.content,
            is_read: row.is_read,
        }
    }
}

pub async fn insert(pool: &SqlitePool, source: MessageSource, content: &str) -> Result<i64, sqlx::Error> {
    let id = sqlx::query("INSERT INTO messages (source, content) VALUES (?, ?)")
        .bind(source.as_db_str())
        .bind(content)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Unread operator messages, oldest first.
pub async fn unread_human(pool: &SqlitePool) -> Result<Vec<Message>, sqlx::Error> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT id, source, content, is_read FROM messages \
         WHERE source = 'human' AND is_read = 0 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Persist the agent's reply and mark every unread human message up to
/// `up_to_id` as read, in one transaction.
pub async fn reply_and_mark_read(pool: &SqlitePool, reply: &str, up_to_id: i64) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let id = sqlx::query("INSERT INTO messages (source, content) VALUES ('agent', ?)")
        .bind(reply)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
    sqlx::query("UPDATE messages SET is_read = 1 WHERE source = 'human' AND is_read = 0 AND id <= ?")
        .bind(up_to_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn all(pool: &SqlitePool) -> Result<Vec<Message>, sqlx::Error> {
    let rows: Vec<MessageRow> =
        sqlx::query_as("SELECT id, source, content, is_read FROM messages ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}
