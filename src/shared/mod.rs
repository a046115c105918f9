pub mod config;
pub mod logging;
pub mod raw_output;
pub mod telemetry;

pub use config::ToolrunConfig;
pub use raw_output::{MemoryRawOutputStore, RawOutputStore};
pub use telemetry::{NoopTelemetry, RecordingTelemetry, TelemetrySink, TracingTelemetry};
