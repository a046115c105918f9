use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolCallError {
    /// Terminal: callers above the invoker must not retry again.
    #[error("{provider}.{tool} failed after {attempts} attempts: {message}")]
    Exhausted {
        provider: String,
        tool: String,
        attempts: u32,
        message: String,
        /// Redacted copy of the request payload.
        payload: Value,
    },
}

impl ToolCallError {
    pub fn payload(&self) -> &Value {
        match self {
            ToolCallError::Exhausted { payload, .. } => payload,
        }
    }
}
