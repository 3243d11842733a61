use serde_json::Value;

use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::types::{ExecutionResult, Plan, Review};

pub const REFLECTION_PLACEHOLDER: &str = "Failed to generate reflection.";

pub fn reflection_context(plan: &Plan, review: &Review, result: &ExecutionResult) -> String {
    format!(
        "PLAN:\n{}\n\nREVIEW:\n{}\n\nEXECUTION:\n{}",
        plan.spec, review.summary, result.report
    )
}

/// Short structured reflection on the finished cycle.
pub async fn reflect(models: &mut ModelManager, plan: &Plan, review: &Review, result: &ExecutionResult) -> String {
    let context = reflection_context(plan, review, result);
    match models.complete(PromptKey::Reflector, &context).await {
        Ok(doc) => doc
            .get("reflection")
            .or_else(|| doc.get("reflection_md"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| REFLECTION_PLACEHOLDER.to_owned()),
        Err(e) => {
            tracing::error!(error = %e, "reflection failed");
            REFLECTION_PLACEHOLDER.to_owned()
        }
    }
}
