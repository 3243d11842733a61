use serde_json::Value;

use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::types::{Plan, PlanStep, Review, ReviewedStep};

/// Score used when the reviewer gives none, or an unusable one.
const UNSCORED_RISK: f64 = 1.0;

fn risk_score(risk: Option<&Value>) -> f64 {
    let score = risk.and_then(|r| r.get("score")).and_then(|s| match s {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    match score {
        Some(s) if s.is_finite() && s >= 0.0 => s.min(1.0),
        _ => UNSCORED_RISK,
    }
}

fn text_field(v: Option<&Value>, key: &str) -> String {
    v.and_then(|r| r.get(key)).and_then(Value::as_str).unwrap_or_default().to_owned()
}

/// Turn a reviewer document into a [`Review`]. Steps the reviewer returned
/// without a command are dropped.
pub fn parse_review(doc: &Value) -> Review {
    let steps = doc
        .get("approved_steps")
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(|s| {
                    let step: PlanStep = serde_json::from_value(s.clone()).ok()?;
                    let risk = s.get("risk");
                    Some(ReviewedStep {
                        step,
                        risk_score: risk_score(risk),
                        risk_category: text_field(risk, "category"),
                        reasoning: text_field(risk, "reasoning"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let rejected = match doc.get("rejected") {
        Some(Value::Array(a)) => a.len(),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    };
    let summary = doc
        .get("summary")
        .or_else(|| doc.get("summary_md"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_owned();
    Review { steps, rejected, summary }
}

/// Keep steps with `risk_score <= threshold`, in order, at most `max_steps`.
pub fn filter_by_risk(steps: &[ReviewedStep], threshold: f64, max_steps: usize) -> Vec<ReviewedStep> {
    steps
        .iter()
        .filter(|s| s.risk_score <= threshold)
        .take(max_steps)
        .cloned()
        .collect()
}

/// Ask the reviewer to score `plan`. A model failure rejects every step.
pub async fn review(models: &mut ModelManager, plan: &Plan) -> Review {
    if plan.steps.is_empty() {
        return Review { steps: Vec::new(), rejected: 0, summary: "Plan had no steps to review.".into() };
    }
    let context = serde_json::to_string_pretty(plan).unwrap_or_default();
    match models.complete(PromptKey::Reviewer, &context).await {
        Ok(doc) => parse_review(&doc),
        Err(e) => {
            tracing::error!(error = %e, "plan review failed");
            Review {
                steps: Vec::new(),
                rejected: plan.steps.len(),
                summary: "Failed to review the plan.".into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reviewed(title: &str, risk: f64) -> ReviewedStep {
        ReviewedStep {
            step: PlanStep { title: title.into(), command: "ls".into(), timeout_sec: 60, allow_net: false },
            risk_score: risk,
            risk_category: "safe".into(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn threshold_keeps_order() {
        let steps = vec![reviewed("s1", 0.1), reviewed("s2", 0.6), reviewed("s3", 0.3)];
        let kept = filter_by_risk(&steps, 0.5, 5);
        let titles: Vec<_> = kept.iter().map(|s| s.step.title.as_str()).collect();
        assert_eq!(titles, vec!["s1", "s3"]);
    }

    #[test]
    fn filter_matches_definition_for_many_inputs() {
        let scores = [0.0, 0.05, 0.2, 0.5, 0.5, 0.51, 0.9, 1.0, 0.3, 0.45];
        for threshold in [0.0, 0.25, 0.5, 0.75, 1.0] {
            for max in 0..=scores.len() + 1 {
                for len in 0..=scores.len() {
                    let steps: Vec<_> = scores[..len]
                        .iter()
                        .enumerate()
                        .map(|(i, &r)| reviewed(&i.to_string(), r))
                        .collect();
                    let kept = filter_by_risk(&steps, threshold, max);
                    let expected: Vec<_> = steps
                        .iter()
                        .filter(|s| s.risk_score <= threshold)
                        .take(max)
                        .map(|s| s.step.title.clone())
                        .collect();
                    let got: Vec<_> = kept.iter().map(|s| s.step.title.clone()).collect();
                    assert_eq!(got, expected);
                }
            }
        }
    }

    #[test]
    fn missing_or_bad_scores_read_as_max_risk() {
        let doc = json!({
            "approved_steps": [
                {"title": "a", "bash": "ls", "risk": {"score": 0.2, "category": "safe", "reasoning": "read"}},
                {"title": "b", "command": "ls"},
                {"title": "c", "command": "ls", "risk": {"score": "0.4"}},
                {"title": "d", "command": "ls", "risk": {"score": -3}},
                {"title": "e", "command": "ls", "risk": {"score": 7}},
                {"title": "no command"}
            ],
            "rejected": [{"title": "x"}],
            "summary_md": "ok"
        });
        let review = parse_review(&doc);
        let scores: Vec<_> = review.steps.iter().map(|s| s.risk_score).collect();
        assert_eq!(scores, vec![0.2, 1.0, 0.4, 1.0, 1.0]);
        assert_eq!(review.steps[0].risk_category, "safe");
        assert_eq!(review.rejected, 1);
        assert_eq!(review.summary, "ok");
    }
}
