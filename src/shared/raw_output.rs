use std::sync::Mutex;

use serde_json::{json, Value};

use crate::sandbox::outcome::SandboxResult;
use crate::tools::envelope::ActionResponse;
use crate::tools::summary::{summarize, PayloadSummary, SummaryOptions};

/// Run-context store for raw tool and sandbox outputs, keyed by
/// `tool.<provider>.<tool>` or `sandbox.<label>`.
pub trait RawOutputStore: Send + Sync {
    fn record(&self, key: String, record: Value);
}

#[derive(Debug, Default)]
pub struct MemoryRawOutputStore {
    records: Mutex<Vec<(String, Value)>>,
}

impl MemoryRawOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, Value)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.records()
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl RawOutputStore for MemoryRawOutputStore {
    fn record(&self, key: String, record: Value) {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push((key, record));
    }
}

pub fn tool_key(provider: &str, tool: &str) -> String {
    format!("tool.{}.{}", provider, tool)
}

pub fn sandbox_key(label: &str) -> String {
    format!("sandbox.{}", label)
}

/// `payload` must already be redacted.
pub fn tool_record(
    provider: &str,
    tool: &str,
    payload: &Value,
    response: &ActionResponse,
) -> Value {
    json!({
        "type": "tool",
        "provider": provider,
        "tool": tool,
        "payload": payload,
        "response": response,
    })
}

pub fn code_preview(code: &str, max_chars: usize) -> String {
    code.chars().take(max_chars).collect()
}

pub fn sandbox_record(
    label: &str,
    code: &str,
    preview_chars: usize,
    result: &SandboxResult,
    summary: Option<&PayloadSummary>,
) -> Value {
    let mut record = json!({
        "type": "sandbox",
        "label": label,
        "code_preview": code_preview(code, preview_chars),
        "result": result,
    });
    if let (Some(summary), Some(obj)) = (summary, record.as_object_mut()) {
        obj.insert("summary".to_string(), json!(summary));
    }
    record
}

/// Summarizes a non-null sandbox result and hands the record to the store.
pub fn record_sandbox_run(
    store: &dyn RawOutputStore,
    label: &str,
    code: &str,
    preview_chars: usize,
    result: &SandboxResult,
    options: &SummaryOptions,
) -> Option<PayloadSummary> {
    let summary = result
        .result
        .as_ref()
        .map(|value| summarize(&sandbox_key(label), &Value::Object(value.clone()), options));
    store.record(
        sandbox_key(label),
        sandbox_record(label, code, preview_chars, result, summary.as_ref()),
    );
    summary
}
