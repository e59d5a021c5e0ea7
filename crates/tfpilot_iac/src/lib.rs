//! # tfpilot_iac
//!
//! Terraform project handling for tfpilot.
//!
//! This crate covers everything between a user's archive and a finished
//! Terraform command:
//!
//! - Session workspaces: extraction, root discovery and cleanup
//! - Credential context: validation, identity probe, child environment
//! - Variable staging: discovery from `*.tf` files and `terraform.tfvars` output,
//!   or a copy of the archive's `terraform.tfvars.example`
//! - Terraform command invocation and output classification
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use tfpilot_iac::{TerraformCommand, TerraformRunner, WorkspaceManager};
//! use tfpilot_runner::TokioRunner;
//!
//! # async fn demo() -> tfpilot_iac::IacResult<()> {
//! let mut workspace = WorkspaceManager::new(WorkspaceManager::default_base_dir());
//! let session = workspace.extract(Path::new("./infra.tar.gz"))?;
//!
//! let terraform = TerraformRunner::new(Arc::new(TokioRunner::default()));
//! let init = terraform
//!     .run(TerraformCommand::Init, &session.root, Default::default(), None, None)
//!     .await?;
//! println!("init exited with {}", init.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod credentials;
pub mod error;
pub mod terraform;
pub mod variables;
pub mod workspace;

pub use classifier::{
    strip_ansi, ApplySummary, DestroySummary, OutputClassifier, PlanSummary, Summary,
    TerraformClassifier,
};
pub use credentials::{
    mask, parse_aws_version, AccountIdentity, AwsCliProbe, ConfigureOutcome, CredentialContext, CredentialSet,
    IdentityProbe,
};
pub use error::{IacError, IacResult};
pub use terraform::{
    parse_version, ProgressHandler, RunOptions, RunResult, TerraformCommand, TerraformRunner,
};
pub use variables::{VariableSet, VariableSpec, EXAMPLE_VALUES_FILE, VALUES_FILE};
pub use workspace::{Session, StaleSweepReport, WorkspaceManager};
