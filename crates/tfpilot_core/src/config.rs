//! Engine configuration.
//!
//! Layered as defaults, then an optional TOML file, then `TFPILOT_*`
//! environment variables. Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tfpilot_iac::{WorkspaceManager, VALUES_FILE};

use crate::error::{CoreError, CoreResult};

pub const ENV_TERRAFORM: &str = "TFPILOT_TERRAFORM";
pub const ENV_BASE_DIR: &str = "TFPILOT_BASE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Terraform binary name or path
    pub terraform_binary: PathBuf,
    /// Directory holding session workspaces
    pub base_dir: PathBuf,
    /// Sessions older than this are swept at startup
    pub stale_session_hours: u64,
    /// Run `aws sts get-caller-identity` after configuring credentials
    pub probe_identity: bool,
    /// Log commands instead of running them
    pub dry_run: bool,
    /// Values file written at the provisioning root. Names Terraform does not
    /// load on its own are passed as `-var-file`.
    pub values_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            terraform_binary: PathBuf::from(tfpilot_iac::terraform::DEFAULT_BINARY),
            base_dir: WorkspaceManager::default_base_dir(),
            stale_session_hours: tfpilot_iac::workspace::DEFAULT_RETENTION_HOURS,
            probe_identity: true,
            dry_run: false,
            values_file: VALUES_FILE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the TOML file at `path`, if given.
    ///
    /// An explicitly named file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&contents)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> CoreResult<Self> {
        toml::from_str(contents).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Apply `TFPILOT_*` variables from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `TFPILOT_*` variables from `lookup`.
    pub fn with_env_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup(ENV_TERRAFORM).filter(|v| !v.is_empty()) {
            self.terraform_binary = PathBuf::from(binary);
        }
        if let Some(dir) = lookup(ENV_BASE_DIR).filter(|v| !v.is_empty()) {
            self.base_dir = PathBuf::from(dir);
        }
        self
    }
}
