use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single exact-substring replacement in one persisted source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub file: String,
    pub old_code: String,
    pub new_code: String,
}

#[derive(Debug, Clone)]
pub struct PatchProposal {
    pub diagnosis: String,
    pub patch: Patch,
    pub test_script: Option<String>,
}

impl PatchProposal {
    /// Read a self-patch document. `None` when it carries no usable patch.
    pub fn from_doc(doc: &Value) -> Option<Self> {
        let patch: Patch = serde_json::from_value(doc.get("patch")?.clone()).ok()?;
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| doc.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        Some(Self {
            diagnosis: text(&["diagnosis"]).unwrap_or_default(),
            patch,
            test_script: text(&["test_script", "test_case"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("old_code not found in file")]
    NotFound,
    #[error("old_code matches {0} places")]
    Ambiguous(usize),
    #[error("old_code is empty")]
    EmptyNeedle,
}

/// Byte offsets of every occurrence of `needle`, overlapping ones included.
fn occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .filter(|&i| haystack[i..].starts_with(needle))
        .collect()
}

/// Replace the single occurrence of `old` in `content` with `new`.
/// Overlapping occurrences count separately.
pub fn apply_exact(content: &str, old: &str, new: &str) -> Result<String, PatchError> {
    if old.is_empty() {
        return Err(PatchError::EmptyNeedle);
    }
    match occurrences(content, old).as_slice() {
        [] => Err(PatchError::NotFound),
        [at] => Ok(format!("{}{new}{}", &content[..*at], &content[at + old.len()..])),
        many => Err(PatchError::Ambiguous(many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_single_match_only() {
        assert_eq!(apply_exact("a b c", "b", "x"), Ok("a x c".into()));
        assert_eq!(apply_exact("a b c", "z", "x"), Err(PatchError::NotFound));
        assert_eq!(apply_exact("b b", "b", "x"), Err(PatchError::Ambiguous(2)));
        assert_eq!(apply_exact("abc", "", "x"), Err(PatchError::EmptyNeedle));
        // whitespace counts
        assert_eq!(apply_exact("fn a() {}", "fn a(){}", "x"), Err(PatchError::NotFound));
    }

    #[test]
    fn overlapping_matches_are_ambiguous() {
        let nested = "fn a() {\n    if x {\n    }\n}\n}\n";
        assert_eq!(apply_exact(nested, "}\n}", "X"), Err(PatchError::Ambiguous(2)));
        assert_eq!(apply_exact("aaa", "aa", "b"), Err(PatchError::Ambiguous(2)));
        assert_eq!(apply_exact("héllo wörld", "wö", "wo"), Ok("héllo world".into()));
    }

    #[test]
    fn proposal_accepts_either_test_field() {
        let doc = json!({
            "diagnosis": "planner uses curl",
            "patch": {"file": "f.rs", "old_code": "a", "new_code": "b"},
            "test_case": "exit 0"
        });
        let p = PatchProposal::from_doc(&doc).unwrap();
        assert_eq!(p.test_script.as_deref(), Some("exit 0"));

        let no_test = json!({"patch": {"file": "f.rs", "old_code": "a", "new_code": "b"}, "test_script": ""});
        assert!(PatchProposal::from_doc(&no_test).unwrap().test_script.is_none());
        assert!(PatchProposal::from_doc(&json!({"diagnosis": "x"})).is_none());
    }
}
