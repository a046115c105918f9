use std::path::PathBuf;

use thiserror::Error;

/// Infrastructure failures raised before any sandbox process is spawned.
/// Everything that happens after spawn is reported through `SandboxResult`.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("Invalid sandbox configuration: {0}")]
    Configuration(String),

    #[error("Failed to prepare sandbox workspace: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("Failed to install sandbox helper package at {path}: {source}")]
    HelperInstall {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;
