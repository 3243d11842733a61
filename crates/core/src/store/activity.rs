use sqlx::SqlitePool;

/// Severity column of `activity_logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

pub async fn insert(
    pool: &SqlitePool,
    loop_id: Option<i64>,
    agent: &str,
    action: &str,
    details: Option<&serde_json::Value>,
    level: Level,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO activity_logs (loop_id, agent, action, details, level) VALUES (?, ?, ?, ?, ?)")
        .bind(loop_id)
        .bind(agent)
        .bind(action)
        .bind(details.map(|d| d.to_string()))
        .bind(level.as_db_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// `(agent, action, level)` rows for one loop, oldest first.
pub async fn for_loop(pool: &SqlitePool, loop_id: i64) -> Result<Vec<(String, String, String)>, sqlx::Error> {
    sqlx::query_as("SELECT agent, action, level FROM activity_logs WHERE loop_id = ? ORDER BY id")
        .bind(loop_id)
        .fetch_all(pool)
        .await
}

/// Best-effort writer for the activity trail. Write failures never reach
/// the caller.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pool: SqlitePool,
}

impl ActivityLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        loop_id: Option<i64>,
        agent: &str,
        action: &str,
        details: Option<serde_json::Value>,
        level: Level,
    ) {
        if let Err(e) = insert(&self.pool, loop_id, agent, action, details.as_ref(), level).await {
            tracing::debug!(agent, action, error = %e, "activity log write failed");
        }
    }
}
