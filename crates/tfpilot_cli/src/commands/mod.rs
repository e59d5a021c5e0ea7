//! CLI command definitions.
//!
//! Each subcommand drives one engine session from archive to cleanup.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use tfpilot_core::{EngineConfig, Step};
use tfpilot_iac::CredentialSet;

pub mod cleanup;
pub mod deploy;
pub mod destroy;
pub mod session;
pub mod variables;

/// tfpilot - guided Terraform deployments from a packaged archive
#[derive(Parser)]
#[command(name = "tfpilot")]
#[command(version, about = "tfpilot - guided Terraform deployments from a packaged archive")]
#[command(long_about = r#"
tfpilot unpacks an archive of Terraform definitions into a private session
workspace, stages credentials and variable values, and walks the definitions
through init, plan and apply (or destroy) with an explicit confirmation gate
before anything is changed.

WORKFLOWS:
  deploy     → init, plan, confirm, apply
               (--example-values uses the archive's terraform.tfvars.example)
  destroy    → init, destroy
  variables  → List the variables an archive declares
  cleanup    → Remove stale session workspaces

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Workflow failure
  4 - Terraform binary not found
  5 - Plan declined
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress streamed Terraform output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Terraform binary name or path
    #[arg(long, global = true, value_name = "PATH")]
    pub terraform: Option<PathBuf>,

    /// Directory holding session workspaces
    #[arg(long, global = true, value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn global(&self) -> GlobalOpts {
        GlobalOpts {
            quiet: self.quiet,
            config: self.config.clone(),
            terraform: self.terraform.clone(),
            base_dir: self.base_dir.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy the definitions in an archive
    Deploy(deploy::DeployArgs),

    /// Destroy the infrastructure managed by an archive
    Destroy(destroy::DestroyArgs),

    /// List the variables declared by an archive
    Variables(variables::VariablesArgs),

    /// Remove session workspaces left behind by earlier runs
    Cleanup(cleanup::CleanupArgs),
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub terraform: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
}

impl GlobalOpts {
    /// Defaults, then the config file, then the environment, then flags.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load(self.config.as_deref())?.with_env();
        if let Some(binary) = &self.terraform {
            config.terraform_binary = binary.clone();
        }
        if let Some(dir) = &self.base_dir {
            config.base_dir = dir.clone();
        }
        Ok(config)
    }
}

/// AWS credential flags, falling back to the standard environment variables.
#[derive(Args, Debug)]
pub struct CredentialArgs {
    /// AWS access key ID
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: Option<String>,

    /// AWS secret access key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,
}

impl CredentialArgs {
    /// Missing fields are left empty for the engine to reject.
    pub fn to_set(&self) -> CredentialSet {
        CredentialSet::new(
            self.access_key.clone().unwrap_or_default(),
            self.secret_key.clone().unwrap_or_default(),
            self.region.clone().unwrap_or_default(),
        )
    }
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub enum CliFailure {
    #[error("{0}")]
    InvalidArgs(String),

    #[error("Terraform binary not found: {0}")]
    BinaryNotFound(String),

    #[error("terraform {step} failed: {message}")]
    Workflow { step: Step, message: String },

    #[error("Plan declined, no changes were applied")]
    Declined,

    #[error("Interrupted, the running command was stopped")]
    Interrupted,

    #[error("Engine rejected the request: {0}")]
    Rejected(String),
}

/// Parse a `NAME=VALUE` pair.
pub fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }
    Ok((name.to_string(), value.to_string()))
}
