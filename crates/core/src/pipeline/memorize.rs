use serde_json::Value;
use sqlx::SqlitePool;

use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::store;
use crate::types::{ExecutionResult, MemoryKind};

/// Observation text for an execution report, cut to `max_chars`.
pub fn observation(result: &ExecutionResult, max_chars: usize) -> String {
    let summary: String = result.report.chars().take(max_chars).collect();
    format!("Execution summary: {summary}")
}

/// Append the reflection and execution observation, then compress if due.
/// Returns the id of a compressed lesson when one was written.
pub async fn memorize(
    pool: &SqlitePool,
    models: &mut ModelManager,
    loop_id: i64,
    reflection: &str,
    result: &ExecutionResult,
    max_chars: usize,
    threshold: i64,
) -> Result<Option<i64>, sqlx::Error> {
    store::memories::insert(pool, MemoryKind::Reflection, reflection, Some(loop_id)).await?;
    if !result.report.is_empty() {
        store::memories::insert(pool, MemoryKind::Observation, &observation(result, max_chars), Some(loop_id))
            .await?;
    }
    compress_if_due(pool, models, threshold).await
}

/// Once `threshold` uncompressed memories exist, summarize the oldest
/// `threshold` of them into a single lesson. A model failure leaves every
/// memory in place.
pub async fn compress_if_due(
    pool: &SqlitePool,
    models: &mut ModelManager,
    threshold: i64,
) -> Result<Option<i64>, sqlx::Error> {
    if threshold <= 0 || store::memories::count_uncompressed(pool).await? < threshold {
        return Ok(None);
    }
    let batch = store::memories::oldest_uncompressed(pool, threshold).await?;
    let context = batch.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n---\n");

    let lesson = match models.complete(PromptKey::MemoryCompressor, &context).await {
        Ok(doc) => doc.get("lesson").and_then(Value::as_str).map(|s| s.trim().to_owned()),
        Err(e) => {
            tracing::warn!(error = %e, "memory compression failed");
            return Ok(None);
        }
    };
    let Some(lesson) = lesson.filter(|l| !l.is_empty()) else {
        tracing::warn!("compressor returned no lesson");
        return Ok(None);
    };

    let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
    let id = store::memories::replace_with_lesson(pool, &ids, &lesson).await?;
    tracing::info!(compressed = ids.len(), lesson_id = id, "memories compressed");
    Ok(Some(id))
}
