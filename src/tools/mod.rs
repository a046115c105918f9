// Tool response handling and tool-call invocation
pub mod client;
pub mod envelope;
pub mod error;
pub mod high_signal;
pub mod invoker;
pub mod redact;
pub mod summary;
pub mod truncate;

pub use envelope::{normalize, ActionResponse};
pub use error::ToolCallError;
pub use invoker::{RetryPolicy, ToolInvoker};
