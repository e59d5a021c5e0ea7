//! Error types for the core module.

use thiserror::Error;

use crate::workflow::WorkflowState;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while orchestrating a workflow.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid transition from {from:?}: {action}")]
    InvalidTransition {
        from: WorkflowState,
        action: &'static str,
    },

    #[error("No workspace extracted")]
    NoSession,

    #[error("Credentials not configured")]
    CredentialsMissing,

    #[error("Missing values for required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("A workflow is already in progress ({0:?})")]
    WorkflowInProgress(WorkflowState),

    #[error("Failed to write {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine is not running")]
    EngineStopped,

    #[error("IaC error: {0}")]
    Iac(#[from] tfpilot_iac::IacError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
