use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::redact::{redact, SensitiveKeys};

const MAX_LABEL_CHARS: usize = 80;

static UNSAFE_LABEL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("static regex"));

#[derive(Debug, Clone)]
pub struct SummaryOptions {
    pub max_chars: usize,
    pub sample_limit: usize,
    pub persist: bool,
    pub storage_dir: Option<PathBuf>,
    pub sensitive_keys: SensitiveKeys,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            sample_limit: 3,
            persist: false,
            storage_dir: None,
            sensitive_keys: SensitiveKeys::default(),
        }
    }
}

/// Schema, sample and aggregates describing a payload too large to hand over whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSummary {
    pub label: String,
    pub is_summary: bool,
    pub original_size: usize,
    pub truncated: bool,
    pub schema: Value,
    pub sample: Value,
    pub aggregates: Map<String, Value>,
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
}

pub fn summarize(label: &str, payload: &Value, options: &SummaryOptions) -> PayloadSummary {
    let redacted = redact(payload, &options.sensitive_keys);
    let serialized = serde_json::to_string(&redacted).unwrap_or_default();
    let original_size = serialized.len();
    let truncated = original_size > options.max_chars;

    let mut notes = Vec::new();
    if truncated {
        notes.push(format!(
            "payload is {} bytes, above the {} character limit; showing a sample",
            original_size, options.max_chars
        ));
    }

    let mut storage_ref = None;
    if truncated || options.persist {
        match options.storage_dir.as_deref() {
            Some(dir) => match persist_payload(dir, label, &serialized) {
                Ok(path) => {
                    info!("Stored full payload for '{}' at {}", label, path.display());
                    notes.push(format!("full payload stored at {}", path.display()));
                    storage_ref = Some(path.display().to_string());
                }
                Err(e) => {
                    warn!("Failed to persist payload for '{}': {}", label, e);
                    notes.push(format!("failed to store full payload: {}", e));
                }
            },
            None if options.persist => {
                notes.push("persist requested but no storage directory is configured".to_string());
            }
            None => {}
        }
    }

    PayloadSummary {
        label: label.to_string(),
        is_summary: true,
        original_size,
        truncated,
        schema: infer_schema(&redacted),
        sample: build_sample(&redacted, options),
        aggregates: build_aggregates(&redacted),
        notes,
        storage_ref,
    }
}

pub fn sanitize_label(label: &str) -> String {
    let replaced = UNSAFE_LABEL_CHARS.replace_all(label, "_");
    let trimmed: String = replaced.trim_matches('_').chars().take(MAX_LABEL_CHARS).collect();
    if trimmed.is_empty() {
        "payload".to_string()
    } else {
        trimmed
    }
}

fn persist_payload(dir: &Path, label: &str, serialized: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", sanitize_label(label)));
    fs::write(&path, serialized)?;
    Ok(path)
}

fn build_sample(value: &Value, options: &SummaryOptions) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().take(options.sample_limit).cloned().collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .take(options.sample_limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        Value::String(s) if s.chars().count() > options.max_chars => {
            Value::String(s.chars().take(options.max_chars).collect())
        }
        other => other.clone(),
    }
}

fn infer_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let keys: BTreeSet<&String> = map.keys().collect();
            json!({"type": "object", "keys": keys})
        }
        Value::Array(items) if !items.is_empty() => {
            if items.iter().all(Value::is_object) {
                let keys: BTreeSet<&String> = items
                    .iter()
                    .filter_map(Value::as_object)
                    .flat_map(|m| m.keys())
                    .collect();
                return json!({"type": "list[object]", "keys": keys});
            }
            let first = type_name(&items[0]);
            let uniform = !matches!(items[0], Value::Array(_))
                && items.iter().all(|item| type_name(item) == first);
            if uniform {
                json!({"type": format!("list[{}]", first), "items": items.len()})
            } else {
                json!({"type": "list"})
            }
        }
        other => json!({"type": type_name(other)}),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn build_aggregates(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    match value {
        Value::Object(map) => {
            out.insert("key_count".to_string(), json!(map.len()));
        }
        Value::Array(items) if !items.is_empty() => {
            let numbers: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
            if let Some(numbers) = numbers {
                let sum: f64 = numbers.iter().sum();
                let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
                let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                out.insert("count".to_string(), json!(numbers.len()));
                out.insert("sum".to_string(), json!(sum));
                out.insert("min".to_string(), json!(min));
                out.insert("max".to_string(), json!(max));
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_redacted() {
        let summary = summarize(
            "slack",
            &json!({"token": "secret123", "ok": 1}),
            &SummaryOptions::default(),
        );
        assert_eq!(summary.sample, json!({"token": "[REDACTED]", "ok": 1}));
        assert!(summary.is_summary);
        assert!(!summary.truncated);
        assert_eq!(summary.aggregates["key_count"], json!(2));
        assert_eq!(summary.schema, json!({"type": "object", "keys": ["ok", "token"]}));
    }

    #[test]
    fn original_size_measures_redacted_serialization() {
        let payload = json!({"password": "a-very-long-password-value"});
        let summary = summarize("p", &payload, &SummaryOptions::default());
        assert_eq!(summary.original_size, r#"{"password":"[REDACTED]"}"#.len());
    }

    #[test]
    fn list_of_objects_schema_unions_keys() {
        let payload = json!([{"b": 1}, {"a": 2}, {"c": 3, "a": 1}, {"d": 4}]);
        let summary = summarize("rows", &payload, &SummaryOptions::default());
        assert_eq!(summary.schema, json!({"type": "list[object]", "keys": ["a", "b", "c", "d"]}));
        assert_eq!(summary.sample.as_array().unwrap().len(), 3);
    }

    #[test]
    fn numeric_lists_get_aggregates() {
        let summary = summarize("nums", &json!([3, 1, 2.5]), &SummaryOptions::default());
        assert_eq!(summary.aggregates["count"], json!(3));
        assert_eq!(summary.aggregates["sum"], json!(6.5));
        assert_eq!(summary.aggregates["min"], json!(1.0));
        assert_eq!(summary.aggregates["max"], json!(3.0));

        let ints = summarize("ints", &json!([1, 2]), &SummaryOptions::default());
        assert_eq!(ints.schema, json!({"type": "list[integer]", "items": 2}));
    }

    #[test]
    fn mixed_and_scalar_schemas() {
        let summary = summarize("mixed", &json!([1, "a"]), &SummaryOptions::default());
        assert_eq!(summary.schema, json!({"type": "list"}));
        assert!(summary.aggregates.is_empty());

        let summary = summarize("text", &json!("hello"), &SummaryOptions::default());
        assert_eq!(summary.schema, json!({"type": "string"}));
        assert_eq!(summary.sample, json!("hello"));
    }

    #[test]
    fn oversized_payload_spills_to_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let options = SummaryOptions {
            max_chars: 10,
            storage_dir: Some(dir.path().to_path_buf()),
            ..SummaryOptions::default()
        };
        let payload = json!({"rows": [1, 2, 3, 4, 5], "api_key": "k"});
        let summary = summarize("gmail/fetch emails", &payload, &options);

        assert!(summary.truncated);
        let stored = summary.storage_ref.clone().unwrap();
        assert!(stored.ends_with("gmail_fetch_emails.json"));
        let written = std::fs::read_to_string(stored).unwrap();
        assert_eq!(written, r#"{"rows":[1,2,3,4,5],"api_key":"[REDACTED]"}"#);
    }

    #[test]
    fn persist_flag_without_directory_adds_note() {
        let options = SummaryOptions {
            persist: true,
            ..SummaryOptions::default()
        };
        let summary = summarize("x", &json!({}), &options);
        assert_eq!(summary.storage_ref, None);
        assert_eq!(summary.notes.len(), 1);
    }

    #[test]
    fn label_sanitization() {
        assert_eq!(sanitize_label("__a b/c__"), "a_b_c");
        assert_eq!(sanitize_label("sandbox.run-1"), "sandbox.run-1");
        assert_eq!(sanitize_label("///"), "payload");
        assert_eq!(sanitize_label(""), "payload");
        assert_eq!(sanitize_label(&"x".repeat(200)).len(), 80);
    }
}
