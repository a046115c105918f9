use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::client::ToolClient;
use super::envelope::{normalize, ActionResponse};
use super::error::ToolCallError;
use super::high_signal;
use super::redact::{redact, SensitiveKeys};
use crate::shared::raw_output::{tool_key, tool_record, RawOutputStore};
use crate::shared::telemetry::{
    with_timestamp, TelemetrySink, TracingTelemetry, TOOL_COMPLETED, TOOL_FAILED,
    TOOL_HIGH_SIGNAL, TOOL_STARTED,
};

/// Linear backoff: the n-th retry waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

/// Calls one tool through a [`ToolClient`] with retries, normalization and telemetry.
pub struct ToolInvoker {
    client: Arc<dyn ToolClient>,
    telemetry: Arc<dyn TelemetrySink>,
    raw_outputs: Option<Arc<dyn RawOutputStore>>,
    retry: RetryPolicy,
    sensitive_keys: SensitiveKeys,
    user_id: Option<String>,
    request_id: Option<String>,
}

impl ToolInvoker {
    pub fn new(client: Arc<dyn ToolClient>) -> Self {
        Self {
            client,
            telemetry: Arc::new(TracingTelemetry),
            raw_outputs: None,
            retry: RetryPolicy::default(),
            sensitive_keys: SensitiveKeys::default(),
            user_id: None,
            request_id: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_raw_output_store(mut self, store: Arc<dyn RawOutputStore>) -> Self {
        self.raw_outputs = Some(store);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sensitive_keys(mut self, keys: SensitiveKeys) -> Self {
        self.sensitive_keys = keys;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Correlates `tool.*` events with the sandbox run that made the call.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Direct-call contract: retry exhaustion becomes a failed envelope.
    pub async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        payload: &Map<String, Value>,
    ) -> ActionResponse {
        match self.try_invoke(provider, tool, payload).await {
            Ok(response) => response,
            Err(err) => ActionResponse::failure(err.to_string()),
        }
    }

    /// Sandbox contract: retry exhaustion is returned as [`ToolCallError`].
    pub async fn try_invoke(
        &self,
        provider: &str,
        tool: &str,
        payload: &Map<String, Value>,
    ) -> Result<ActionResponse, ToolCallError> {
        let started = Instant::now();
        let redacted = redact(&Value::Object(payload.clone()), &self.sensitive_keys);
        let mut payload_keys: Vec<&String> = payload.keys().collect();
        payload_keys.sort();

        self.emit(
            TOOL_STARTED,
            json!({
                "provider": provider,
                "tool": tool,
                "payload_keys": payload_keys,
                "user_id": self.user_id,
            }),
        );

        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        let mut last_error = String::new();
        let mut raw = None;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.retry.delay_for(attempts)).await;
            }
            attempts += 1;
            match self.client.call(tool, payload).await {
                Ok(value) => {
                    raw = Some(value);
                    break;
                }
                Err(err) => {
                    last_error = format!("{:#}", err);
                    warn!(
                        provider = provider,
                        tool = tool,
                        attempt = attempts,
                        "Tool call attempt failed: {}",
                        last_error
                    );
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;

        let Some(raw) = raw else {
            let err = ToolCallError::Exhausted {
                provider: provider.to_string(),
                tool: tool.to_string(),
                attempts,
                message: last_error,
                payload: redacted.clone(),
            };
            self.emit(
                TOOL_FAILED,
                json!({
                    "provider": provider,
                    "tool": tool,
                    "error": err.to_string(),
                    "attempts": attempts,
                    "duration_ms": duration_ms,
                }),
            );
            self.record(
                provider,
                tool,
                &redacted,
                &ActionResponse::failure(err.to_string()),
            );
            return Err(err);
        };

        let response = normalize(Some(&raw));
        let signals = high_signal::extract(provider, tool, &response.data_value());
        if !signals.is_empty() {
            self.emit(
                TOOL_HIGH_SIGNAL,
                json!({"provider": provider, "tool": tool, "fields": signals}),
            );
        }

        info!(
            provider = provider,
            tool = tool,
            successful = response.successful,
            attempts = attempts,
            "Tool call completed in {}ms",
            duration_ms
        );
        self.emit(
            TOOL_COMPLETED,
            json!({
                "provider": provider,
                "tool": tool,
                "successful": response.successful,
                "error": response.error,
                "attempts": attempts,
                "duration_ms": duration_ms,
            }),
        );
        self.record(provider, tool, &redacted, &response);

        Ok(response)
    }

    fn emit(&self, event: &str, data: Value) {
        let data = match data {
            Value::Object(mut map) => {
                if let Some(request_id) = &self.request_id {
                    map.insert("request_id".to_string(), json!(request_id));
                }
                with_timestamp(map)
            }
            other => other,
        };
        self.telemetry.emit(event, data);
    }

    fn record(&self, provider: &str, tool: &str, redacted: &Value, response: &ActionResponse) {
        if let Some(store) = &self.raw_outputs {
            store.record(
                tool_key(provider, tool),
                tool_record(provider, tool, redacted, response),
            );
        }
    }
}
