//! Execution Error Types
//!
//! Errors produced once a command has passed validation. None of them cross
//! the service boundary as faults; the service renders them as text.

use std::time::Duration;

/// Generic message when a failing process printed nothing on stderr
pub const GENERIC_FAILURE: &str = "Command failed";

/// Error types for process execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The OS could not create the process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The process ran and reported failure
    #[error("{message}")]
    NonZeroExit { code: Option<i32>, message: String },

    /// No result within the allotted time
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Reading a stream or waiting on the process failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected orchestration fault
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Build a non-zero-exit error from captured stderr
    pub fn non_zero_exit(code: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            GENERIC_FAILURE.to_string()
        } else {
            stderr.to_string()
        };
        Self::NonZeroExit { code, message }
    }

    /// Metric label for this error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "spawn_failed",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::Timeout(_) => "timeout",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}
