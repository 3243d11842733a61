use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;

use super::classify::classify;
use super::gate::{self, GateRejection};
use super::patch::PatchProposal;
use super::sandbox::PatchSandbox;
use crate::failure;
use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::store::activity::{ActivityLog, Level};
use crate::store::sources::{self, ApplyError};

const AGENT: &str = "SelfPatch";

/// How one self-patch check ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    NoRecurringFailure,
    SourceMissing { file: String },
    ModelUnavailable,
    NoPatchProposed,
    Rejected(GateRejection),
    /// Verification failed or was impossible (no test script). Nothing changed.
    TestFailed { logs: String },
    SandboxFailed { error: String },
    /// Verified, but the persisted file no longer matches.
    ApplyConflict { error: String },
    /// Persisted; takes effect after an external restart.
    Applied { file: String, version: i64 },
}

pub struct SelfPatchEngine {
    pool: SqlitePool,
    sandbox: Arc<dyn PatchSandbox>,
    activity: ActivityLog,
    min_failures: i64,
}

impl SelfPatchEngine {
    pub fn new(pool: SqlitePool, sandbox: Arc<dyn PatchSandbox>, min_failures: i64) -> Self {
        let activity = ActivityLog::new(pool.clone());
        Self { pool, sandbox, activity, min_failures }
    }

    /// One pass of diagnose, propose, gate, verify, apply. Only store errors
    /// escape; every other problem is an outcome.
    pub async fn run_check(&self, models: &mut ModelManager, loop_id: Option<i64>) -> Result<PatchOutcome, sqlx::Error> {
        let outcome = self.check(models).await?;
        let level = match &outcome {
            PatchOutcome::Applied { .. } => Level::Success,
            PatchOutcome::NoRecurringFailure | PatchOutcome::NoPatchProposed => Level::Info,
            PatchOutcome::Rejected(_) | PatchOutcome::SandboxFailed { .. } => Level::Error,
            _ => Level::Warning,
        };
        self.activity
            .record(loop_id, AGENT, "Self-patch check finished", Some(json!({ "outcome": format!("{outcome:?}") })), level)
            .await;
        Ok(outcome)
    }

    async fn check(&self, models: &mut ModelManager) -> Result<PatchOutcome, sqlx::Error> {
        let Some(top) = failure::top_failure(&self.pool, self.min_failures).await? else {
            tracing::info!("no recurring failure worth patching");
            return Ok(PatchOutcome::NoRecurringFailure);
        };
        let component = classify(&top.error_message);
        let path = component.source_path();
        tracing::info!(pattern = %top.command_pattern, count = top.count, ?component, file = path, "recurring failure found");

        let Some(source) = sources::fetch(&self.pool, path).await? else {
            tracing::error!(file = path, "responsible source file not persisted");
            return Ok(PatchOutcome::SourceMissing { file: path.to_owned() });
        };

        let failure_json = serde_json::to_string_pretty(&top).unwrap_or_default();
        let context = format!("FAILURE PATTERN:\n{failure_json}\n\nSOURCE CODE of {path}:\n{}", source.content);
        let doc = match models.complete(PromptKey::SelfPatch, &context).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "no model available for self-patch");
                return Ok(PatchOutcome::ModelUnavailable);
            }
        };
        let Some(proposal) = PatchProposal::from_doc(&doc) else {
            tracing::info!("model proposed no patch");
            return Ok(PatchOutcome::NoPatchProposed);
        };
        let patch = proposal.patch;
        tracing::info!(file = %patch.file, diagnosis = %proposal.diagnosis, "patch proposed");

        if let Err(rejection) = gate::check(&patch.file) {
            tracing::error!(file = %patch.file, %rejection, "patch rejected by security gate");
            return Ok(PatchOutcome::Rejected(rejection));
        }

        let Some(script) = proposal.test_script else {
            tracing::warn!(file = %patch.file, "patch has no test script, discarding");
            return Ok(PatchOutcome::TestFailed { logs: "No test script provided".into() });
        };

        let tree = sources::fetch_all(&self.pool).await?;
        let outcome = match self.sandbox.run_test(&tree, &patch, &script).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(file = %patch.file, error = %e, "sandbox failed, discarding patch");
                return Ok(PatchOutcome::SandboxFailed { error: e.to_string() });
            }
        };
        if !outcome.passed {
            tracing::warn!(file = %patch.file, "patch failed its test, discarding");
            return Ok(PatchOutcome::TestFailed { logs: outcome.logs });
        }

        match sources::apply_patch_and_resolve(&self.pool, &patch, top.id).await {
            Ok(version) => {
                tracing::warn!(file = %patch.file, version, "source patched; restart required for it to take effect");
                Ok(PatchOutcome::Applied { file: patch.file, version })
            }
            Err(ApplyError::Store(e)) => Err(e),
            Err(e) => {
                tracing::error!(file = %patch.file, error = %e, "verified patch no longer applies");
                Ok(PatchOutcome::ApplyConflict { error: e.to_string() })
            }
        }
    }
}
