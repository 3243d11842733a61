use serde_json::Value;

use crate::context::LoopContext;
use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::types::{Plan, PlanStep};

/// Read a plan document leniently: malformed steps are dropped, not fatal.
pub fn parse_plan(doc: &Value) -> Plan {
    let spec = doc
        .get("spec")
        .or_else(|| doc.get("spec_md"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_owned();
    let steps = doc
        .get("steps")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(|s| match serde_json::from_value::<PlanStep>(s.clone()) {
                    Ok(step) if !step.command.trim().is_empty() => Some(step),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed plan step");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    Plan { spec, steps }
}

/// Ask the planner for this iteration's plan. Never fails; a model failure
/// yields [`Plan::placeholder`].
pub async fn generate(models: &mut ModelManager, ctx: &LoopContext) -> Plan {
    match models.complete(PromptKey::Planner, &ctx.full_context).await {
        Ok(doc) => {
            let plan = parse_plan(&doc);
            tracing::info!(steps = plan.steps.len(), "plan generated");
            plan
        }
        Err(e) => {
            tracing::error!(error = %e, "plan generation failed");
            Plan::placeholder()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_parse_keeps_good_steps() {
        let doc = json!({
            "spec_md": "  Build a report  ",
            "steps": [
                {"title": "a", "bash": "ls"},
                {"title": "no command"},
                {"title": "blank", "command": "  "},
                {"title": "b", "command": "cat x", "timeout_sec": 5, "allow_net": true}
            ]
        });
        let plan = parse_plan(&doc);
        assert_eq!(plan.spec, "Build a report");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].timeout_sec, 5);
        assert!(plan.steps[1].allow_net);
    }

    #[test]
    fn missing_fields_give_empty_plan() {
        let plan = parse_plan(&json!({"unrelated": 1}));
        assert!(plan.spec.is_empty());
        assert!(plan.steps.is_empty());
    }
}
