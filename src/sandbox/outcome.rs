use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::harness::SENTINEL;
use crate::tools::envelope::wrap_value;

const MAX_ERROR_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Building,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Outcome of one sandbox invocation. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    pub result: Option<Map<String, Value>>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl SandboxResult {
    pub fn succeeded(result: Map<String, Value>, logs: Vec<String>) -> Self {
        Self {
            success: true,
            result: Some(result),
            logs,
            error: None,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            success: false,
            result: None,
            logs,
            error: Some(error.into()),
            timed_out: false,
        }
    }

    pub fn timed_out(timeout: Duration, stdout: &str, stderr: &str) -> Self {
        let mut logs = log_lines(stdout);
        logs.extend(log_lines(stderr));
        Self {
            success: false,
            result: None,
            logs,
            error: Some(format!("Timeout after {}s", timeout.as_secs_f64())),
            timed_out: true,
        }
    }

    /// Resolves a normally exited process. The sentinel payload wins over the
    /// exit code; the exit code is only used as a fallback diagnostic.
    pub fn from_exit(stdout: &str, stderr: &str, exit_code: Option<i32>) -> Self {
        let Some((line_start, line)) = last_sentinel_line(stdout) else {
            let mut logs = log_lines(stdout);
            logs.extend(log_lines(stderr));
            return Self::failed(missing_sentinel_error(stderr, exit_code), logs);
        };
        // The payload starts at the first marker on that line.
        let marker = line.find(SENTINEL).unwrap_or(0);

        let mut logs = log_lines(&stdout[..line_start + marker]);
        logs.extend(log_lines(&stdout[line_start + line.len()..]));
        logs.extend(log_lines(stderr));

        let payload_text = line[marker + SENTINEL.len()..].trim();
        let payload: Value = match serde_json::from_str(payload_text) {
            Ok(payload) => payload,
            Err(e) => return Self::failed(format!("Failed to parse sandbox result: {}", e), logs),
        };

        let Value::Object(mut fields) = payload else {
            return Self::failed("Sandbox result payload is not a JSON object", logs);
        };

        if let Some(error) = fields.remove("error") {
            let message = match error {
                Value::String(s) if !s.trim().is_empty() => s,
                Value::String(_) | Value::Null => "Sandbox code raised an error".to_string(),
                other => other.to_string(),
            };
            return Self::failed(message, logs);
        }

        let result = fields.remove("result").map(wrap_value).unwrap_or_default();
        Self::succeeded(result, logs)
    }

    pub fn state(&self) -> SandboxState {
        if self.success {
            SandboxState::Succeeded
        } else if self.timed_out {
            SandboxState::TimedOut
        } else {
            SandboxState::Failed
        }
    }
}

/// Byte offset and text (newline included) of the last line carrying the sentinel.
fn last_sentinel_line(stdout: &str) -> Option<(usize, &str)> {
    let mut offset = 0;
    let mut found = None;
    for line in stdout.split_inclusive('\n') {
        if line.contains(SENTINEL) {
            found = Some((offset, line));
        }
        offset += line.len();
    }
    found
}

fn missing_sentinel_error(stderr: &str, exit_code: Option<i32>) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return tail_chars(stderr, MAX_ERROR_CHARS);
    }
    match exit_code {
        Some(code) if code != 0 => {
            format!("Sandbox exited with status {} without producing a result", code)
        }
        None => "Sandbox was terminated by a signal without producing a result".to_string(),
        _ => "No result sentinel found in sandbox output".to_string(),
    }
}

fn log_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect()
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
