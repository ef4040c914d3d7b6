//! Error taxonomy for run requests and run execution.
//!
//! A non-zero exit code is not an error: it is reported as a completed run
//! with `success = false`.

use std::path::PathBuf;

/// Errors produced while accepting, launching or supervising a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("failed to spawn {interpreter} {script}: {reason}")]
    SpawnFailed {
        interpreter: PathBuf,
        script: PathBuf,
        reason: String,
    },

    #[error("job already registered: {0}")]
    DuplicateJob(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Whether the error was raised before any job id was allocated.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RunError::InvalidRequest(_) | RunError::UnknownModel(_))
    }
}

/// Result type for run operations.
pub type Result<T> = std::result::Result<T, RunError>;
