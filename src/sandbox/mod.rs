// Sandbox process runner: generated program, child process lifecycle, sentinel framing
pub mod error;
pub mod harness;
pub mod outcome;
pub mod runner;

pub use error::SandboxError;
pub use outcome::{SandboxResult, SandboxState};
pub use runner::{SandboxConfig, SandboxRequest, SandboxRunner};
