use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::failure;
use crate::types::{ExecutionResult, PlanStep, ReviewedStep};

/// Extra time granted to the runner on top of the per-step timeouts.
const RUNNER_SLACK_SECS: u64 = 30;

/// Executes approved steps in the sandboxed shell. Implementations report
/// every problem through the returned result instead of failing.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, steps: &[PlanStep]) -> ExecutionResult;
}

/// Step as the runner script expects it on its command line.
#[derive(Serialize)]
struct WireStep<'a> {
    title: &'a str,
    bash: &'a str,
    timeout_sec: u64,
    allow_net: bool,
}

/// Invokes the external runner script with the steps as one JSON argument
/// and reads `{success, failed, final_report_md}` from its stdout.
pub struct ScriptRunner {
    script: PathBuf,
    cwd: PathBuf,
}

impl ScriptRunner {
    pub fn new(script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self { script: script.into(), cwd: cwd.into() }
    }
}

fn execution_error(detail: impl std::fmt::Display) -> ExecutionResult {
    ExecutionResult::runner_failure(
        "execution_error",
        format!("execution error: {detail}"),
        "Execution FAILED: the step runner did not complete.",
    )
}

/// Parse runner stdout; anything unparsable becomes a single `parse_error` failure.
pub fn parse_runner_output(stdout: &[u8]) -> ExecutionResult {
    match serde_json::from_slice::<ExecutionResult>(stdout) {
        Ok(result) => result,
        Err(e) => ExecutionResult::runner_failure(
            "parse_error",
            format!("parse error: {e}"),
            "Execution FAILED: runner output could not be parsed.",
        ),
    }
}

#[async_trait]
impl StepRunner for ScriptRunner {
    async fn run(&self, steps: &[PlanStep]) -> ExecutionResult {
        let wire: Vec<WireStep<'_>> = steps
            .iter()
            .map(|s| WireStep { title: &s.title, bash: &s.command, timeout_sec: s.timeout_sec, allow_net: s.allow_net })
            .collect();
        let payload = match serde_json::to_string(&wire) {
            Ok(p) => p,
            Err(e) => return execution_error(e),
        };
        let budget = Duration::from_secs(steps.iter().map(|s| s.timeout_sec).sum::<u64>() + RUNNER_SLACK_SECS);

        let result = tokio::time::timeout(
            budget,
            tokio::process::Command::new(&self.script)
                .arg(&payload)
                .current_dir(&self.cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => parse_runner_output(&output.stdout),
            Ok(Ok(output)) => {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::error!(code, stderr = %stderr.trim(), "runner script failed");
                execution_error(format!("runner exited with code {code}: {}", stderr.trim()))
            }
            Ok(Err(e)) => {
                tracing::error!(script = %self.script.display(), error = %e, "runner script could not start");
                execution_error(e)
            }
            Err(_) => execution_error(format!("runner timed out after {}s", budget.as_secs())),
        }
    }
}

/// Run the retained steps and record every failed one. With nothing
/// retained the runner is not invoked.
pub async fn execute(
    runner: &dyn StepRunner,
    pool: &SqlitePool,
    steps: &[ReviewedStep],
) -> Result<ExecutionResult, sqlx::Error> {
    if steps.is_empty() {
        tracing::info!("no steps approved, skipping execution");
        return Ok(ExecutionResult::nothing_executed());
    }
    let plan_steps: Vec<PlanStep> = steps.iter().map(|s| s.step.clone()).collect();
    let result = runner.run(&plan_steps).await;
    failure::record(pool, &result.failed).await?;
    tracing::info!(succeeded = result.succeeded.len(), failed = result.failed.len(), "execution complete");
    Ok(result)
}
