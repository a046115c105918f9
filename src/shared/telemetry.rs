use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::info;

pub const TOOL_STARTED: &str = "tool.started";
pub const TOOL_COMPLETED: &str = "tool.completed";
pub const TOOL_FAILED: &str = "tool.failed";
pub const TOOL_HIGH_SIGNAL: &str = "tool.high_signal";
pub const SANDBOX_RUN: &str = "sandbox.run";

/// Fire-and-forget lifecycle event sink. Implementations must not block or panic.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &str, data: Value);
}

/// Stamps `ts` onto an event payload.
pub fn with_timestamp(mut data: Map<String, Value>) -> Value {
    data.insert(
        "ts".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Value::Object(data)
}

/// Writes each event as one structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: &str, data: Value) {
        info!(target: "toolrun::telemetry", event = event, data = %data, "telemetry");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn emit(&self, _event: &str, _data: Value) {}
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn named(&self, event: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data)
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: &str, data: Value) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((event.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingTelemetry::new();
        sink.emit(TOOL_STARTED, json!({"n": 1}));
        sink.emit(TOOL_COMPLETED, json!({"n": 2}));
        sink.emit(TOOL_STARTED, json!({"n": 3}));

        let names: Vec<String> = sink.events().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![TOOL_STARTED, TOOL_COMPLETED, TOOL_STARTED]);
        assert_eq!(sink.named(TOOL_STARTED), vec![json!({"n": 1}), json!({"n": 3})]);
    }

    #[test]
    fn timestamp_is_added() {
        let mut data = Map::new();
        data.insert("k".to_string(), json!(1));
        let stamped = with_timestamp(data);
        assert!(stamped["ts"].as_str().is_some());
        assert_eq!(stamped["k"], json!(1));
    }
}
