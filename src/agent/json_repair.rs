//! Robust JSON extraction, schema validation, and iterative patch-repair (component I, SPEC_FULL
//! §4.9a) for agent output that only *approximates* valid JSON.
//!
//! Extraction heuristics grounded on `examples/original_source/json_pipeline.py`'s layered
//! fallback (direct parse, fenced block, balanced-brace scan, textual repairs). The repair loop
//! itself is grounded on `examples/original_source/trustcall.py`'s "extract, validate, patch,
//! re-validate" cycle, generalized to RFC 6902 JSON Patch instead of trustcall's bespoke diff
//! format.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::role::{FieldType, Schema};

/// Attempts, in order, until one parses: a fenced code block (```json ... ``` or ``` ... ```),
/// then the first balanced `{...}` span found anywhere in the text.
static FENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)```").unwrap());

/// Extracts a JSON value from free-form LLM text. Mirrors `json_pipeline.py`'s layering: try the
/// whole text first (cheapest, most common case when the model behaves), then narrow down.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(captures) = FENCE_PATTERN.captures(trimmed) {
        let inner = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
        if let Some(repaired) = repair_and_parse(inner) {
            return Some(repaired);
        }
    }

    if let Some(span) = find_balanced_braces(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            return Some(value);
        }
        if let Some(repaired) = repair_and_parse(span) {
            return Some(repaired);
        }
    }

    repair_and_parse(trimmed)
}

/// Scans for the first top-level `{...}` span with balanced braces, ignoring braces inside string
/// literals so embedded `}` characters in prose don't prematurely close the span.
fn find_balanced_braces(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Applies textual repair heuristics (trailing commas, single-quoted strings, unquoted keys,
/// doubled quotes) and re-attempts a parse after each. Order matches `json_pipeline.py`: cheapest
/// and safest fixes first, since each repair risks corrupting otherwise-valid JSON.
fn repair_and_parse(candidate: &str) -> Option<Value> {
    let mut repaired = candidate.to_string();

    repaired = strip_trailing_commas(&repaired);
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Some(value);
    }

    repaired = collapse_doubled_quotes(&repaired);
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Some(value);
    }

    repaired = quote_bare_keys(&repaired);
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Some(value);
    }

    repaired = single_to_double_quotes(&repaired);
    serde_json::from_str(&repaired).ok()
}

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static BARE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").unwrap());

fn strip_trailing_commas(input: &str) -> String {
    TRAILING_COMMA.replace_all(input, "$1").into_owned()
}

fn quote_bare_keys(input: &str) -> String {
    BARE_KEY.replace_all(input, "$1\"$2\"$3").into_owned()
}

fn single_to_double_quotes(input: &str) -> String {
    input.replace('\'', "\"")
}

fn collapse_doubled_quotes(input: &str) -> String {
    input.replace("\"\"", "\"")
}

/// Checks `value` against `schema`: every field must be present with the right JSON type.
/// Returns the list of problems found, empty if valid.
pub fn validate(value: &Value, schema: &Schema) -> Vec<String> {
    let mut issues = Vec::new();
    let Some(object) = value.as_object() else {
        return vec!["top-level value is not a JSON object".to_string()];
    };

    for field in schema {
        match object.get(field.name.as_str()) {
            None => issues.push(format!("missing required field '{}'", field.name)),
            Some(found) if !matches_type(found, field.field_type) => {
                issues.push(format!(
                    "field '{}' has wrong type: expected {:?}, got {}",
                    field.name, field.field_type, type_name(found)
                ));
            }
            Some(_) => {}
        }
    }
    issues
}

fn matches_type(value: &Value, expected: FieldType) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Object => value.is_object(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One JSON Patch operation (RFC 6902), the subset the repair loop emits/consumes.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

/// Applies a sequence of patch ops to `target` in place. Unknown/malformed paths are skipped with
/// a warning rather than failing the whole patch, matching `trustcall.py`'s best-effort apply.
pub fn apply_patch(target: &mut Value, ops: &[PatchOp]) {
    for op in ops {
        match op {
            PatchOp::Add { path, value } | PatchOp::Replace { path, value } => {
                if let Some((parent, key)) = navigate_to_parent(target, path) {
                    if let Some(obj) = parent.as_object_mut() {
                        obj.insert(key.to_string(), value.clone());
                        continue;
                    }
                }
                warn!(path, "patch op targeted an unreachable path, skipping");
            }
            PatchOp::Remove { path } => {
                if let Some((parent, key)) = navigate_to_parent(target, path) {
                    if let Some(obj) = parent.as_object_mut() {
                        obj.remove(key);
                        continue;
                    }
                }
                warn!(path, "remove op targeted an unreachable path, skipping");
            }
        }
    }
}

/// Resolves a `/a/b/c` JSON Pointer path down to its parent object and final key segment.
fn navigate_to_parent<'a>(root: &'a mut Value, path: &'a str) -> Option<(&'a mut Value, &'a str)> {
    let mut segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let last = segments.pop()?;

    let mut current = root;
    for segment in segments {
        current = current.get_mut(segment)?;
    }
    Some((current, last))
}

/// Bound on repair attempts before giving up, SPEC_FULL §4.9a.
pub const MAX_REPAIR_ATTEMPTS: u32 = 3;

/// Outcome of running the full iterative repair loop.
pub enum RepairOutcome {
    Valid(Value),
    /// Exhausted retries; caller degrades to treating the agent's output as plain text.
    ExhaustedAttempts { last_issues: Vec<String> },
}

/// Runs the extract -> validate -> (patch via `patch_fn`) -> re-validate loop up to
/// `MAX_REPAIR_ATTEMPTS` times. `patch_fn` is the caller's LLM round-trip that, given the current
/// value and the list of issues, returns a patch to apply -- kept generic so this module has no
/// direct HTTP dependency.
pub async fn repair_loop<F, Fut>(initial_text: &str, schema: &Schema, mut patch_fn: F) -> RepairOutcome
where
    F: FnMut(&Value, &[String]) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Vec<PatchOp>>>,
{
    let Some(mut value) = extract_json(initial_text) else {
        return RepairOutcome::ExhaustedAttempts {
            last_issues: vec!["could not extract any JSON from the response".to_string()],
        };
    };

    let mut issues = validate(&value, schema);
    if issues.is_empty() {
        return RepairOutcome::Valid(value);
    }

    for attempt in 1..=MAX_REPAIR_ATTEMPTS {
        debug!(attempt, issues = ?issues, "attempting json patch repair");
        match patch_fn(&value, &issues).await {
            Ok(ops) => apply_patch(&mut value, &ops),
            Err(err) => {
                warn!(%err, attempt, "patch generation failed");
                continue;
            }
        }
        issues = validate(&value, schema);
        if issues.is_empty() {
            return RepairOutcome::Valid(value);
        }
    }

    RepairOutcome::ExhaustedAttempts { last_issues: issues }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::role::SchemaField;

    fn test_schema() -> Schema {
        vec![
            SchemaField { name: "summary".to_string(), field_type: FieldType::String },
            SchemaField { name: "score".to_string(), field_type: FieldType::Number },
        ]
    }

    #[test]
    fn extracts_direct_json() {
        let value = extract_json(r#"{"summary": "ok", "score": 5}"#).unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn extracts_from_fenced_code_block() {
        let text = "Here is the result:\n```json\n{\"summary\": \"fenced\", \"score\": 3}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["summary"], "fenced");
    }

    #[test]
    fn extracts_balanced_braces_from_surrounding_prose() {
        let text = "Sure! {\"summary\": \"embedded\", \"score\": 1} Hope that helps.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["summary"], "embedded");
    }

    #[test]
    fn repairs_trailing_comma() {
        let value = extract_json(r#"{"summary": "trailing", "score": 2,}"#).unwrap();
        assert_eq!(value["summary"], "trailing");
    }

    #[test]
    fn repairs_single_quoted_strings() {
        let value = extract_json(r#"{'summary': 'single quoted', 'score': 4}"#).unwrap();
        assert_eq!(value["summary"], "single quoted");
    }

    #[test]
    fn validate_reports_missing_and_wrong_type_fields() {
        let value = serde_json::json!({"summary": 123});
        let issues = validate(&value, &test_schema());
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn validate_passes_well_formed_value() {
        let value = serde_json::json!({"summary": "fine", "score": 9});
        assert!(validate(&value, &test_schema()).is_empty());
    }

    #[test]
    fn apply_patch_replaces_and_removes_fields() {
        let mut value = serde_json::json!({"summary": "old", "score": 1});
        let ops = vec![
            PatchOp::Replace { path: "/summary".to_string(), value: serde_json::json!("new") },
            PatchOp::Remove { path: "/score".to_string() },
        ];
        apply_patch(&mut value, &ops);
        assert_eq!(value["summary"], "new");
        assert!(value.get("score").is_none());
    }

    #[tokio::test]
    async fn repair_loop_succeeds_when_patch_fixes_missing_field() {
        let outcome = repair_loop(r#"{"summary": "partial"}"#, &test_schema(), |_value, _issues| async {
            Ok(vec![PatchOp::Add {
                path: "/score".to_string(),
                value: serde_json::json!(7),
            }])
        })
        .await;
        assert!(matches!(outcome, RepairOutcome::Valid(_)));
    }

    #[tokio::test]
    async fn repair_loop_exhausts_after_max_attempts() {
        let outcome = repair_loop(r#"{"summary": "stuck"}"#, &test_schema(), |_value, _issues| async {
            Ok(vec![])
        })
        .await;
        assert!(matches!(outcome, RepairOutcome::ExhaustedAttempts { .. }));
    }
}
