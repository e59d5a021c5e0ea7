//! Error types for IaC module.

use thiserror::Error;

/// Result type alias for IaC operations.
pub type IacResult<T> = Result<T, IacError>;

/// Errors that can occur during IaC operations.
#[derive(Error, Debug)]
pub enum IacError {
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("No Terraform definition files found in {0}")]
    NoDefinitionFilesFound(String),

    #[error("Missing credential field: {0}")]
    MissingCredentialField(&'static str),

    #[error("Failed to write {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Failed to remove stale session {path}: {message}")]
    StaleSessionCleanupFailed { path: String, message: String },

    #[error("No example values file at {0}")]
    ExampleValuesMissing(String),

    #[error("Values file already exists: {0}")]
    ValuesFileExists(String),

    #[error("Could not read tool version from: {0}")]
    VersionUnknown(String),

    #[error("Identity probe failed: {0}")]
    ProbeFailed(String),

    #[error("Runner error: {0}")]
    Runner(#[from] tfpilot_runner::RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
