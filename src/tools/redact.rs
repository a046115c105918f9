use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

pub const DEFAULT_SENSITIVE_KEYS: &[&str] =
    &["token", "authorization", "password", "api_key", "secret"];

/// Case-insensitive set of map keys whose values must never leave the process.
#[derive(Debug, Clone)]
pub struct SensitiveKeys {
    keys: Vec<String>,
}

impl SensitiveKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.keys.iter().any(|k| *k == lower)
    }
}

impl Default for SensitiveKeys {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_KEYS.iter().copied())
    }
}

/// Recursively masks values stored under sensitive keys, preserving all other structure.
pub fn redact(value: &Value, keys: &SensitiveKeys) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let masked = if keys.matches(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact(inner, keys)
                };
                out.insert(key.clone(), masked);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| redact(item, keys)).collect()),
        other => other.clone(),
    }
}

pub fn redact_default(value: &Value) -> Value {
    redact(value, &SensitiveKeys::default())
}
