use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Structural caps applied to tool data before it is shown to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncateLimits {
    pub max_depth: usize,
    pub max_string_chars: usize,
    pub max_items: usize,
}

impl Default for TruncateLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_string_chars: 500,
            max_items: 20,
        }
    }
}

pub fn truncate(data: &Value, limits: &TruncateLimits) -> Value {
    truncate_at(data, limits, 0)
}

pub fn truncate_map(data: &Map<String, Value>, limits: &TruncateLimits) -> Value {
    truncate_at(&Value::Object(data.clone()), limits, 0)
}

fn truncate_at(value: &Value, limits: &TruncateLimits, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            if depth >= limits.max_depth {
                return Value::String(format!("<object truncated at depth {}>", depth));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(key.clone(), truncate_at(inner, limits, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return Value::String(format!("<array truncated at depth {}>", depth));
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.max_items)
                .map(|item| truncate_at(item, limits, depth + 1))
                .collect();
            if items.len() > limits.max_items {
                out.push(json!({
                    "_truncated": true,
                    "_total": items.len(),
                }));
            }
            Value::Array(out)
        }
        Value::String(s) => {
            let mut chars = s.chars();
            let head: String = chars.by_ref().take(limits.max_string_chars).collect();
            if chars.next().is_some() {
                Value::String(format!("{}...", head))
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}
