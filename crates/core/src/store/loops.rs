use sqlx::SqlitePool;

use crate::types::{LoopRecord, LoopStatus};

#[derive(sqlx::FromRow)]
struct LoopRow {
    id: i64,
    status: String,
    plan_spec: Option<String>,
    review_summary: Option<String>,
    execution_report: Option<String>,
    reflection: Option<String>,
    error: Option<String>,
}

impl From<LoopRow> for LoopRecord {
    fn from(row: LoopRow) -> Self {
        Self {
            id: row.id,
            status: LoopStatus::from_db(&row.status).unwrap_or(LoopStatus::Failed),
            plan_spec: row.plan_spec,
            review_summary: row.review_summary,
            execution_report: row.execution_report,
            reflection: row.reflection,
            error: row.error,
        }
    }
}

const SELECT: &str = "SELECT id, status, plan_spec, review_summary, execution_report, reflection, error FROM loops";

/// Insert a new `running` loop row. Ids come from AUTOINCREMENT, so they
/// strictly increase and are never reused.
pub async fn start(pool: &SqlitePool, mission_id: Option<i64>) -> Result<i64, sqlx::Error> {
    let id = sqlx::query("INSERT INTO loops (mission_id, status) VALUES (?, ?)")
        .bind(mission_id)
        .bind(LoopStatus::Running.as_db_str())
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Stage columns that may be filled in while a loop runs.
#[derive(Debug, Clone, Copy)]
pub enum Field {
    PlanSpec,
    ReviewSummary,
    ExecutionReport,
    Reflection,
}

impl Field {
    fn column(self) -> &'static str {
        match self {
            Self::PlanSpec => "plan_spec",
            Self::ReviewSummary => "review_summary",
            Self::ExecutionReport => "execution_report",
            Self::Reflection => "reflection",
        }
    }
}

pub async fn set(pool: &SqlitePool, id: i64, field: Field, value: &str) -> Result<(), sqlx::Error> {
    let sql = format!(
        "UPDATE loops SET {} = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        field.column()
    );
    sqlx::query(&sql).bind(value).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn complete(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
    finish(pool, id, LoopStatus::Completed, None).await
}

pub async fn fail(pool: &SqlitePool, id: i64, error: &str) -> Result<(), sqlx::Error> {
    finish(pool, id, LoopStatus::Failed, Some(error)).await
}

async fn finish(
    pool: &SqlitePool,
    id: i64,
    status: LoopStatus,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE loops SET status = ?, error = COALESCE(?, error), updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_db_str())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark loops left `running` by a previous process as failed.
pub async fn fail_stale_running(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE loops SET status = 'failed', error = 'interrupted by restart', \
         updated_at = CURRENT_TIMESTAMP WHERE status = 'running'",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn fetch(pool: &SqlitePool, id: i64) -> Result<Option<LoopRecord>, sqlx::Error> {
    let row: Option<LoopRow> = sqlx::query_as(&format!("{SELECT} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

/// Most recent loop, excluding `exclude_id` (the one currently running).
pub async fn last_before(pool: &SqlitePool, exclude_id: i64) -> Result<Option<LoopRecord>, sqlx::Error> {
    let row: Option<LoopRow> = sqlx::query_as(&format!("{SELECT} WHERE id < ? ORDER BY id DESC LIMIT 1"))
        .bind(exclude_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

pub async fn count_running(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM loops WHERE status = 'running'")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loop_lifecycle() {
        let pool = crate::store::in_memory().await.unwrap();
        let a = start(&pool, None).await.unwrap();
        set(&pool, a, Field::PlanSpec, "plan").await.unwrap();
        complete(&pool, a).await.unwrap();

        let b = start(&pool, None).await.unwrap();
        assert!(b > a);
        fail(&pool, b, "boom").await.unwrap();
        // terminal rows stay terminal
        complete(&pool, b).await.unwrap();

        let rec = fetch(&pool, b).await.unwrap().unwrap();
        assert_eq!(rec.status, LoopStatus::Failed);
        assert_eq!(rec.error.as_deref(), Some("boom"));
        assert_eq!(fetch(&pool, a).await.unwrap().unwrap().plan_spec.as_deref(), Some("plan"));
        assert_eq!(last_before(&pool, b).await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn stale_running_rows_are_failed() {
        let pool = crate::store::in_memory().await.unwrap();
        start(&pool, None).await.unwrap();
        assert_eq!(count_running(&pool).await.unwrap(), 1);
        assert_eq!(fail_stale_running(&pool).await.unwrap(), 1);
        assert_eq!(count_running(&pool).await.unwrap(), 0);
    }
}
