use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const UNKNOWN_ERROR: &str = "unknown_error";

/// Success flags tried in order. Providers spell this field inconsistently,
/// including the historical `successfull`.
const SUCCESS_KEYS: [&str; 3] = ["successful", "success", "successfull"];

/// Keys that mark a decoded Composio text block as a second envelope.
const ENVELOPE_MARKERS: [&str; 4] = [
    "successfull",
    "successful",
    "auth_refresh_required",
    "log_id",
];

/// Canonical tool response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub successful: bool,
    pub data: Map<String, Value>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ActionResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            successful: false,
            data: Map::new(),
            error: Some(if message.trim().is_empty() {
                UNKNOWN_ERROR.to_string()
            } else {
                message
            }),
            raw: None,
        }
    }

    pub fn data_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Converts a raw tool response of any shape into an [`ActionResponse`].
///
/// Never fails: unknown shapes fall through the success chain to `successful = true`.
pub fn normalize(raw: Option<&Value>) -> ActionResponse {
    let Some(raw_value) = raw.filter(|v| !v.is_null()) else {
        return ActionResponse {
            successful: true,
            data: Map::new(),
            error: None,
            raw: None,
        };
    };

    let Some(fields) = raw_value.as_object() else {
        return ActionResponse {
            successful: true,
            data: wrap_value(raw_value.clone()),
            error: None,
            raw: Some(raw_value.clone()),
        };
    };

    let successful = derive_success(fields);
    let data = match fields.get("data") {
        Some(data) => unwrap_composio(wrap_value(collapse_data(data.clone()))),
        None => Map::new(),
    };
    let error = if successful {
        None
    } else {
        Some(derive_error(fields.get("error")))
    };

    ActionResponse {
        successful,
        data,
        error,
        raw: Some(raw_value.clone()),
    }
}

fn derive_success(fields: &Map<String, Value>) -> bool {
    for key in SUCCESS_KEYS {
        if let Some(flag) = fields.get(key).filter(|v| !v.is_null()) {
            return truthy(flag);
        }
    }
    if let Some(error) = fields.get("error") {
        return is_empty_error(error);
    }
    true
}

fn is_empty_error(error: &Value) -> bool {
    match error {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn derive_error(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Object(obj)) => match obj.get("message").and_then(|m| m.as_str()) {
            Some(message) if !message.trim().is_empty() => message.to_string(),
            _ => Value::Object(obj.clone()).to_string(),
        },
        Some(Value::Array(items)) if !items.is_empty() => Value::Array(items.clone()).to_string(),
        _ => UNKNOWN_ERROR.to_string(),
    }
}

/// Strips `{"data": {...}}` wrappers left by upstream layers, one level per match.
fn collapse_data(mut value: Value) -> Value {
    loop {
        let inner = match &value {
            Value::Object(map) if map.len() == 1 => match map.get("data") {
                Some(Value::Object(inner)) => Value::Object(inner.clone()),
                _ => break,
            },
            _ => break,
        };
        value = inner;
    }
    value
}

pub fn wrap_value(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Decodes Composio's `{"content": [{"text": "<json>"}], "isError": bool}` wrapper.
/// Only one level of double-encoding is removed.
fn unwrap_composio(data: Map<String, Value>) -> Map<String, Value> {
    let Some(is_error) = data.get("isError").and_then(|v| v.as_bool()) else {
        return data;
    };
    let Some(text) = data
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|items| items.first())
        .and_then(|first| first.get("text"))
        .and_then(|t| t.as_str())
    else {
        return data;
    };

    let parsed: Value = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("Composio content text is not JSON, keeping original data: {}", err);
            return data;
        }
    };

    let Some(inner) = parsed.as_object() else {
        return wrap_value(parsed);
    };
    let looks_like_envelope =
        inner.contains_key("data") && ENVELOPE_MARKERS.iter().any(|k| inner.contains_key(*k));
    if !looks_like_envelope {
        return inner.clone();
    }

    let explicitly_failed = ["successful", "successfull"]
        .iter()
        .any(|k| inner.get(*k).and_then(|v| v.as_bool()) == Some(false));
    if is_error || explicitly_failed {
        return inner.clone();
    }

    inner.get("data").cloned().map(wrap_value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn norm(raw: Value) -> ActionResponse {
        normalize(Some(&raw))
    }

    #[test]
    fn success_keys_follow_priority_order() {
        assert!(!norm(json!({"successful": false, "success": true})).successful);
        assert!(norm(json!({"success": true, "successfull": false})).successful);
        assert!(!norm(json!({"successfull": false, "error": null})).successful);
        assert!(!norm(json!({"error": "boom"})).successful);
        assert!(norm(json!({"successful": null, "success": true})).successful);
    }

    #[test]
    fn error_false_and_missing_flags_are_successful() {
        let resp = norm(json!({"error": false, "data": {"id": 1}}));
        assert!(resp.successful);
        assert_eq!(resp.error, None);

        assert!(norm(json!({"data": {"id": 1}})).successful);
        assert!(norm(json!({"error": ""})).successful);
    }

    #[test]
    fn failure_without_error_gets_unknown_error() {
        let resp = norm(json!({"successful": false}));
        assert!(!resp.successful);
        assert_eq!(resp.error.as_deref(), Some(UNKNOWN_ERROR));

        let resp = norm(json!({"success": false, "error": ""}));
        assert_eq!(resp.error.as_deref(), Some(UNKNOWN_ERROR));
    }

    #[test]
    fn explicit_error_string_is_kept() {
        let resp = norm(json!({"successful": false, "error": "rate limited"}));
        assert_eq!(resp.error.as_deref(), Some("rate limited"));

        let resp = norm(json!({"error": {"message": "bad channel"}}));
        assert_eq!(resp.error.as_deref(), Some("bad channel"));
    }

    #[test]
    fn double_nested_data_collapses_once() {
        let resp = norm(json!({"successful": true, "data": {"data": {"x": 1}}}));
        assert_eq!(resp.data_value(), json!({"x": 1}));

        let resp = norm(json!({"data": {"data": {"x": 1}, "page": 2}}));
        assert_eq!(resp.data_value(), json!({"data": {"x": 1}, "page": 2}));
    }

    #[test]
    fn non_map_data_is_wrapped() {
        assert_eq!(norm(json!({"data": [1, 2]})).data_value(), json!({"value": [1, 2]}));
        assert_eq!(norm(json!({"data": "ok"})).data_value(), json!({"value": "ok"}));
        assert_eq!(norm(json!({"data": {"data": 5}})).data_value(), json!({"data": 5}));
        assert_eq!(norm(json!({"successful": true})).data_value(), json!({}));
    }

    #[test]
    fn raw_is_preserved_only_for_present_input() {
        let raw = json!({"successful": true, "data": {"a": 1}});
        assert_eq!(norm(raw.clone()).raw, Some(raw));
        let empty = normalize(None);
        assert!(empty.successful);
        assert_eq!(empty.raw, None);
        assert!(empty.data.is_empty());
    }

    #[test]
    fn normalizing_preserved_raw_is_idempotent() {
        let raw = json!({"successful": false, "data": {"data": {"x": 1}}, "error": "nope"});
        let first = norm(raw);
        let second = normalize(first.raw.as_ref());
        assert_eq!(first, second);
    }

    #[test]
    fn composio_envelope_is_unwrapped() {
        let raw = json!({
            "successful": true,
            "data": {
                "content": [{"text": "{\"data\": {\"a\": 1}, \"successful\": true}"}],
                "isError": false
            }
        });
        assert_eq!(norm(raw).data_value(), json!({"a": 1}));
    }

    #[test]
    fn composio_failed_envelope_is_surfaced_whole() {
        let raw = json!({
            "data": {
                "content": [{
                    "text": "{\"data\": {\"a\": 1}, \"successful\": false, \"error\": \"expired\"}"
                }],
                "isError": false
            }
        });
        assert_eq!(
            norm(raw).data_value(),
            json!({"data": {"a": 1}, "successful": false, "error": "expired"})
        );

        let raw = json!({
            "data": {
                "content": [{"text": "{\"data\": {}, \"log_id\": \"l1\"}"}],
                "isError": true
            }
        });
        assert_eq!(norm(raw).data_value(), json!({"data": {}, "log_id": "l1"}));
    }

    #[test]
    fn composio_plain_json_and_garbage() {
        let raw = json!({"data": {"content": [{"text": "{\"rows\": 3}"}], "isError": false}});
        assert_eq!(norm(raw).data_value(), json!({"rows": 3}));

        let original = json!({"content": [{"text": "not json"}], "isError": false});
        let raw = json!({"data": original.clone()});
        assert_eq!(norm(raw).data_value(), original);
    }

    #[test]
    fn composio_unwrap_is_single_level() {
        let block = json!({
            "content": [{"text": "{\"data\": {\"z\": 1}, \"successful\": true}"}],
            "isError": false
        });
        let inner = json!({"data": block.clone(), "successful": true});
        let raw = json!({
            "data": {
                "content": [{"text": inner.to_string()}],
                "isError": false
            }
        });
        assert_eq!(norm(raw).data_value(), block);
    }

    #[test]
    fn failure_constructor_never_has_empty_error() {
        assert_eq!(ActionResponse::failure("").error.as_deref(), Some(UNKNOWN_ERROR));
        assert_eq!(ActionResponse::failure("down").error.as_deref(), Some("down"));
    }
}
