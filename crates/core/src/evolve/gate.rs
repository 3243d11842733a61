use std::path::{Component, Path};

/// Exact file names no patch may target.
const PROTECTED_FILES: &[&str] = &["run_steps.sh", "exec_policy.json", "dockerfile.sandbox"];
/// Substrings that mark a path as protected wherever they appear.
const PROTECTED_FRAGMENTS: &[&str] = &["run_steps", "exec_policy", "dockerfile", "evolve/gate"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateRejection {
    #[error("patch targets protected file {0}")]
    Protected(String),
    #[error("patch path leaves the source tree: {0}")]
    OutsideTree(String),
    #[error("patch has no target file")]
    NoTarget,
}

/// Decide whether a patch may touch `file`. Comparison is case-insensitive.
pub fn check(file: &str) -> Result<(), GateRejection> {
    let trimmed = file.trim();
    if trimmed.is_empty() {
        return Err(GateRejection::NoTarget);
    }
    let normalized = trimmed.replace('\\', "/").to_lowercase();
    let name = normalized.rsplit('/').next().unwrap_or(&normalized);
    if PROTECTED_FILES.contains(&name) || PROTECTED_FRAGMENTS.iter().any(|f| normalized.contains(f)) {
        return Err(GateRejection::Protected(trimmed.to_owned()));
    }
    if !Path::new(&normalized).components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(GateRejection::OutsideTree(trimmed.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_names_are_rejected_in_any_form() {
        for f in [
            "run_steps.sh",
            "./run_steps.sh",
            "scripts/RUN_STEPS.sh",
            "exec_policy.json",
            "config/exec_policy.v2.json",
            "Dockerfile.sandbox",
            "Dockerfile",
            "crates/core/src/evolve/gate.rs",
            "crates\\core\\src\\evolve\\gate.rs",
        ] {
            assert!(matches!(check(f), Err(GateRejection::Protected(_))), "{f}");
        }
    }

    #[test]
    fn escapes_are_rejected() {
        assert!(matches!(check("../secrets.rs"), Err(GateRejection::OutsideTree(_))));
        assert!(matches!(check("/etc/passwd"), Err(GateRejection::OutsideTree(_))));
        assert_eq!(check("  "), Err(GateRejection::NoTarget));
    }

    #[test]
    fn ordinary_sources_pass() {
        assert_eq!(check("crates/core/src/pipeline/plan.rs"), Ok(()));
        assert_eq!(check("crates/core/src/prompts.rs"), Ok(()));
    }

    #[test]
    fn no_content_can_unlock_a_protected_name() {
        // the gate sees only the path; vary it around every protected token
        for token in PROTECTED_FRAGMENTS.iter().chain(PROTECTED_FILES) {
            for wrap in ["{}", "a/{}", "{}.bak", "A/{}/b.rs", "./{}"] {
                let path = wrap.replace("{}", &token.to_uppercase());
                assert!(check(&path).is_err(), "{path}");
            }
        }
    }
}
