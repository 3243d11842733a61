//! Pull one structured document out of free model text.
//!
//! Locating and repairing are both ordered rule tables so each heuristic can
//! be exercised on its own.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no structured document in response: {preview}")]
    Unparsable { preview: String },
}

static TAGGED_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:yaml|yml)[ \t]*\r?\n?(.*?)\s*```").ok());
static ANY_FENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n?(.*?)\s*```").ok());
static KEY_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\w+:").ok());

type Locator = fn(&str) -> Option<String>;

/// Candidate locations, most specific first.
const LOCATORS: &[(&str, Locator)] = &[
    ("tagged_fence", tagged_fence),
    ("generic_fence", generic_fence),
    ("first_key_line", first_key_line),
];

fn tagged_fence(text: &str) -> Option<String> {
    let caps = TAGGED_FENCE.as_ref()?.captures(text)?;
    Some(caps.get(1)?.as_str().trim().to_owned())
}

fn generic_fence(text: &str) -> Option<String> {
    let caps = ANY_FENCE.as_ref()?.captures(text)?;
    let body = caps.get(1)?.as_str();
    (body.contains(':') || body.contains('{')).then(|| body.trim().to_owned())
}

fn strip_fence_markers(text: &str) -> &str {
    text.trim_matches('`').trim()
}

fn first_key_line(text: &str) -> Option<String> {
    let cleaned = strip_fence_markers(text);
    if !cleaned.contains(':') || !cleaned.contains('\n') {
        return None;
    }
    let re = KEY_LINE.as_ref()?;
    let lines: Vec<&str> = cleaned.lines().collect();
    let start = lines.iter().position(|l| re.is_match(l))?;
    Some(lines[start..].join("\n").trim().to_owned())
}

/// First matching locator, or the fence-stripped text.
pub fn locate(text: &str) -> String {
    for (name, locate) in LOCATORS {
        if let Some(found) = locate(text) {
            tracing::trace!(rule = name, "structured block located");
            return found;
        }
    }
    strip_fence_markers(text).to_owned()
}

/// One textual repair: `applies` decides, `apply` rewrites.
pub struct RepairRule {
    pub name: &'static str,
    pub applies: fn(&str) -> bool,
    pub apply: fn(&str) -> String,
}

pub const REPAIRS: &[RepairRule] = &[
    RepairRule { name: "close_quotes", applies: has_unclosed_quote, apply: close_quotes },
    RepairRule { name: "fill_empty_values", applies: has_empty_value, apply: fill_empty_values },
];

fn unclosed(line: &str) -> bool {
    line.matches('"').count() % 2 == 1 && !line.trim_end().ends_with('"')
}

fn has_unclosed_quote(doc: &str) -> bool {
    doc.lines().any(unclosed)
}

pub fn close_quotes(doc: &str) -> String {
    doc.lines()
        .map(|l| if unclosed(l) { format!("{l}\"") } else { l.to_owned() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `key:` with nothing after it, followed by a line that is neither nested
/// nor a list item.
fn empty_value_at(lines: &[&str], i: usize) -> bool {
    lines[i].trim().ends_with(':')
        && lines
            .get(i + 1)
            .is_some_and(|next| !next.is_empty() && !next.starts_with(' ') && !next.starts_with('-'))
}

fn has_empty_value(doc: &str) -> bool {
    let lines: Vec<&str> = doc.lines().collect();
    (0..lines.len()).any(|i| empty_value_at(&lines, i))
}

pub fn fill_empty_values(doc: &str) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    (0..lines.len())
        .map(|i| {
            if empty_value_at(&lines, i) {
                format!("{} \"\"", lines[i])
            } else {
                lines[i].to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse `doc` as YAML; only a top-level mapping counts.
fn parse_mapping(doc: &str) -> Option<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(doc).ok()?;
    if !yaml.is_mapping() {
        return None;
    }
    serde_json::to_value(yaml).ok()
}

/// Try `doc` as-is, then after each applicable repair in order. Repairs
/// accumulate.
pub fn parse_with_repairs(doc: &str) -> Option<Value> {
    if let Some(v) = parse_mapping(doc) {
        return Some(v);
    }
    let mut current = doc.to_owned();
    for rule in REPAIRS {
        if !(rule.applies)(&current) {
            continue;
        }
        current = (rule.apply)(&current);
        if let Some(v) = parse_mapping(&current) {
            tracing::debug!(rule = rule.name, "structured document repaired");
            return Some(v);
        }
    }
    None
}

/// Dependent field present without its required sibling: `(present, missing, placeholder)`.
const SIBLINGS: &[(&str, &[&str], &str)] = &[("steps", &["spec", "spec_md"], "Generated plan")];

fn inject_siblings(mut v: Value) -> Value {
    if let Some(obj) = v.as_object_mut() {
        for (present, required, placeholder) in SIBLINGS {
            if obj.contains_key(*present) && !required.iter().any(|k| obj.contains_key(*k)) {
                obj.insert(required[0].to_owned(), Value::String((*placeholder).to_owned()));
            }
        }
    }
    v
}

/// Outermost `{ ... }` span parsed as JSON.
fn brace_fallback(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let v: Value = serde_json::from_str(&text[start..=end]).ok()?;
    v.is_object().then_some(v)
}

/// Extract the structured document from a model response.
pub fn extract_document(text: &str) -> Result<Value, ExtractError> {
    let located = locate(text);
    if let Some(v) = parse_with_repairs(&located) {
        return Ok(inject_siblings(v));
    }
    if let Some(v) = brace_fallback(text) {
        tracing::debug!("structured document parsed from brace fallback");
        return Ok(inject_siblings(v));
    }
    let preview: String = text.chars().take(200).collect();
    Err(ExtractError::Unparsable { preview })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_fence_wins_over_prose() {
        let text = "Sure thing:\n```yaml\nlesson: keep it short\n```\ntrailing words: here";
        let v = extract_document(text).unwrap();
        assert_eq!(v["lesson"], "keep it short");
    }

    #[test]
    fn generic_fence_needs_a_delimiter() {
        assert!(generic_fence("```\nplain words\n```").is_none());
        let v = extract_document("```\nresponse: hi\n```").unwrap();
        assert_eq!(v["response"], "hi");
    }

    #[test]
    fn starts_at_first_key_line() {
        let text = "Here is my reflection, as requested.\nreflection: |\n  KEY LESSON: x\n";
        let v = extract_document(text).unwrap();
        assert_eq!(v["reflection"].as_str().unwrap().trim(), "KEY LESSON: x");
    }

    #[test]
    fn unbalanced_quote_is_closed() {
        let v = extract_document("response: \"on it").unwrap();
        assert_eq!(v["response"], "on it");
    }

    #[test]
    fn empty_value_rule_is_independent() {
        assert!(has_empty_value("a:\nb: 1"));
        assert_eq!(fill_empty_values("a:\nb: 1"), "a: \"\"\nb: 1");
        // nested values and list items are left alone
        assert!(!has_empty_value("a:\n  b: 1\nc:\n- x"));
    }

    #[test]
    fn missing_spec_is_injected() {
        let v = extract_document("```yaml\nsteps:\n  - title: t\n    command: ls\n```").unwrap();
        assert_eq!(v["spec"], "Generated plan");
        assert_eq!(v["steps"][0]["command"], "ls");
    }

    #[test]
    fn json_fallback() {
        let v = extract_document("Result => {\"lesson\":\"x\",\"n\":[1,2]} done").unwrap();
        assert_eq!(v["lesson"], "x");
    }

    #[test]
    fn scalar_text_is_rejected() {
        assert!(matches!(
            extract_document("I cannot help with that."),
            Err(ExtractError::Unparsable { .. })
        ));
    }
}
