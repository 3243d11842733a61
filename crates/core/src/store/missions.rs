use sqlx::SqlitePool;

use crate::types::Mission;

#[derive(sqlx::FromRow)]
struct MissionRow {
    id: i64,
    mission_text: String,
    is_core: bool,
    is_complete: bool,
}

impl From<MissionRow> for Mission {
    fn from(row: MissionRow) -> Self {
        Self {
            id: row.id,
            text: row.mission_text,
            is_core: row.is_core,
            is_complete: row.is_complete,
        }
    }
}

/// Seed the core mission if none exists. Returns the core mission either way.
pub async fn ensure_core(pool: &SqlitePool, text: &str) -> Result<Mission, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let existing: Option<MissionRow> = sqlx::query_as(
        "SELECT id, mission_text, is_core, is_complete FROM missions WHERE is_core = 1 LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let mission = match existing {
        Some(row) => row.into(),
        None => {
            let id = sqlx::query("INSERT INTO missions (mission_text, is_core) VALUES (?, 1)")
                .bind(text)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
            tracing::info!(mission_id = id, "core mission seeded");
            Mission { id, text: text.to_owned(), is_core: true, is_complete: false }
        }
    };
    tx.commit().await?;
    Ok(mission)
}

/// The mission the loop should work on: incomplete, core first, newest first.
pub async fn active(pool: &SqlitePool) -> Result<Option<Mission>, sqlx::Error> {
    let row: Option<MissionRow> = sqlx::query_as(
        "SELECT id, mission_text, is_core, is_complete FROM missions \
         WHERE is_complete = 0 ORDER BY is_core DESC, id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_mission_is_seeded_once() {
        let pool = crate::store::in_memory().await.unwrap();
        let first = ensure_core(&pool, "explore").await.unwrap();
        let second = ensure_core(&pool, "something else").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.text, "explore");

        let active = active(&pool).await.unwrap().unwrap();
        assert!(active.is_core);
        assert_eq!(active.text, "explore");
    }
}
