/// Part of the loop most likely responsible for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Planner,
    Prompts,
    Executor,
    ModelResponse,
}

impl Component {
    /// Persisted source file holding this component.
    pub fn source_path(self) -> &'static str {
        match self {
            Self::Planner => "crates/core/src/pipeline/plan.rs",
            Self::Prompts => "crates/core/src/prompts.rs",
            Self::Executor => "crates/core/src/pipeline/execute.rs",
            Self::ModelResponse => "crates/core/src/model/extract.rs",
        }
    }
}

/// Lowercased error-text needles, checked in order. First hit wins.
const RULES: &[(&[&str], Component)] = &[
    (&["denied by policy"], Component::Planner),
    (&["not in the allowed list"], Component::Prompts),
    (&["execution"], Component::Executor),
    (&["yaml", "parse"], Component::ModelResponse),
];

pub fn classify(error: &str) -> Component {
    let text = error.to_lowercase();
    RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
        .map(|(_, c)| *c)
        .unwrap_or(Component::Planner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_order() {
        assert_eq!(classify("curl: denied by policy"), Component::Planner);
        assert_eq!(classify("wget is not in the allowed list"), Component::Prompts);
        assert_eq!(classify("Execution error: runner exited"), Component::Executor);
        assert_eq!(classify("YAML parse failure"), Component::ModelResponse);
        assert_eq!(classify("something else"), Component::Planner);
        // earlier rules win over later ones
        assert_eq!(classify("execution denied by policy"), Component::Planner);
    }
}
