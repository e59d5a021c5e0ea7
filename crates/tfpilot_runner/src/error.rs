//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while supervising a subprocess.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Working directory does not exist: {0}")]
    WorkdirMissing(String),

    #[error("Failed to spawn {binary}: {message}")]
    SpawnFailed { binary: String, message: String },

    #[error("Process exited with code {code}: {tail}")]
    ExitCode { code: i32, tail: String },

    #[error("Process was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether the error happened before the process produced any output.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            Self::BinaryNotFound(_) | Self::WorkdirMissing(_) | Self::SpawnFailed { .. }
        )
    }
}
