//! Aggregates execution failures by command signature.

use sqlx::SqlitePool;

use crate::store::{self, failures::FailureSample};
use crate::types::{Failure, StepOutcome};

const MAX_ERROR_CHARS: usize = 500;

/// First whitespace-separated token of `command`.
pub fn command_pattern(command: &str) -> String {
    command.split_whitespace().next().unwrap_or("unknown").to_owned()
}

fn sample(step: &StepOutcome) -> FailureSample {
    let command = if step.command.trim().is_empty() { &step.title } else { &step.command };
    let error = if step.stderr.trim().is_empty() { &step.stdout } else { &step.stderr };
    FailureSample {
        pattern: command_pattern(command),
        example: command.clone(),
        error: error.trim().chars().take(MAX_ERROR_CHARS).collect(),
    }
}

/// Upsert one row per failed step in a single transaction.
pub async fn record(pool: &SqlitePool, failed: &[StepOutcome]) -> Result<usize, sqlx::Error> {
    let samples: Vec<FailureSample> = failed.iter().map(sample).collect();
    store::failures::upsert(pool, &samples).await?;
    for s in &samples {
        tracing::debug!(pattern = %s.pattern, "failure recorded");
    }
    Ok(samples.len())
}

/// The dominant failure, if it has recurred at least `min_count` times.
pub async fn top_failure(pool: &SqlitePool, min_count: i64) -> Result<Option<Failure>, sqlx::Error> {
    Ok(store::failures::top(pool).await?.filter(|f| f.count >= min_count))
}
