//! Operator-supplied cloud credentials.
//!
//! Credentials only ever live in memory. They are handed to subprocesses
//! through the environment and never written to files or logs; `Debug`
//! output is masked and the types are not serializable.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tfpilot_runner::{CommandConfig, ProcessRunner};

use crate::error::{IacError, IacResult};

pub const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
pub const REGION_VAR: &str = "AWS_REGION";
pub const DEFAULT_REGION_VAR: &str = "AWS_DEFAULT_REGION";

/// Variables set from a configured credential set.
pub const CREDENTIAL_VARS: [&str; 4] = [
    ACCESS_KEY_VAR,
    SECRET_KEY_VAR,
    REGION_VAR,
    DEFAULT_REGION_VAR,
];

/// Ambient variables that could make the tool pick up other credentials.
pub const AMBIENT_VARS: [&str; 5] = [
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
    "AWS_CONFIG_FILE",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_SESSION_TOKEN",
];

/// Mask all but the first and last four characters.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

/// Access key, secret key and region.
#[derive(Clone, Default)]
pub struct CredentialSet {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key", &mask(&self.access_key))
            .field("secret_key", &mask(&self.secret_key))
            .field("region", &self.region)
            .finish()
    }
}

impl CredentialSet {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    /// Trim all fields and reject blank ones.
    pub fn validated(&self) -> IacResult<Self> {
        let field = |value: &str, name: &'static str| {
            let value = value.trim();
            if value.is_empty() {
                Err(IacError::MissingCredentialField(name))
            } else {
                Ok(value.to_string())
            }
        };

        Ok(Self {
            access_key: field(&self.access_key, "access_key")?,
            secret_key: field(&self.secret_key, "secret_key")?,
            region: field(&self.region, "region")?,
        })
    }
}

/// Caller identity reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Arn")]
    pub arn: String,
    #[serde(rename = "UserId", default)]
    pub user_id: String,
}

/// Connectivity check run after credentials are configured.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    async fn probe(&self, env: &HashMap<String, String>) -> IacResult<AccountIdentity>;
}

/// Probe that runs `aws sts get-caller-identity`.
pub struct AwsCliProbe {
    runner: Arc<dyn ProcessRunner>,
    binary: PathBuf,
}

impl AwsCliProbe {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            binary: PathBuf::from("aws"),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Installed AWS CLI version, such as `2.15.30`.
    pub async fn version(&self) -> IacResult<String> {
        let config = CommandConfig::new(&self.binary).arg("--version");
        let result = self.runner.run(&config, None).await?;
        // Version 1 prints to stderr
        let output = result.combined_output();
        parse_aws_version(&output).ok_or_else(|| {
            IacError::VersionUnknown(output.lines().next().unwrap_or_default().trim().to_string())
        })
    }
}

fn aws_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"aws-cli/(\d+(?:\.\d+)*)").expect("valid version regex"))
}

/// Version number from `aws --version` output.
pub fn parse_aws_version(output: &str) -> Option<String> {
    aws_version_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl IdentityProbe for AwsCliProbe {
    async fn probe(&self, env: &HashMap<String, String>) -> IacResult<AccountIdentity> {
        let config = CommandConfig::new(&self.binary)
            .args(["sts", "get-caller-identity", "--output", "json"])
            .environment(env.clone());

        let result = self
            .runner
            .run(&config, None)
            .await
            .map_err(|e| IacError::ProbeFailed(e.to_string()))?;

        Ok(serde_json::from_str(result.stdout.trim())?)
    }
}

/// Outcome of [`CredentialContext::configure`].
#[derive(Debug, Clone, Default)]
pub struct ConfigureOutcome {
    pub identity: Option<AccountIdentity>,
    /// Set when the identity probe failed; configuration still succeeded.
    pub warning: Option<String>,
}

/// Holds the active credential set and derives subprocess environments.
pub struct CredentialContext {
    credentials: Option<CredentialSet>,
    identity: Option<AccountIdentity>,
    base_env: HashMap<String, String>,
    probe: Option<Arc<dyn IdentityProbe>>,
}

impl Default for CredentialContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialContext {
    /// Context over the current process environment, without a probe.
    ///
    /// Variables that are not valid Unicode are left out of child processes.
    pub fn new() -> Self {
        Self::with_base_env(utf8_env(std::env::vars_os()))
    }

    pub fn with_base_env(base_env: HashMap<String, String>) -> Self {
        Self {
            credentials: None,
            identity: None,
            base_env,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn IdentityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn identity(&self) -> Option<&AccountIdentity> {
        self.identity.as_ref()
    }

    pub fn region(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.region.as_str())
    }

    /// Access key safe for display.
    pub fn masked_access_key(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| mask(&c.access_key))
    }

    /// Store a credential set and run the identity probe.
    ///
    /// A failing probe does not reject the credentials.
    pub async fn configure(&mut self, set: CredentialSet) -> IacResult<ConfigureOutcome> {
        let set = set.validated()?;
        info!(
            "Configuring credentials {} for region {}",
            mask(&set.access_key),
            set.region
        );

        self.credentials = Some(set);
        self.identity = None;

        let mut outcome = ConfigureOutcome::default();
        if let Some(probe) = &self.probe {
            match probe.probe(&self.environment()).await {
                Ok(identity) => {
                    info!("Credentials verified for account {}", identity.account);
                    self.identity = Some(identity.clone());
                    outcome.identity = Some(identity);
                }
                Err(e) => {
                    warn!("Identity probe failed: {}", e);
                    outcome.warning = Some(e.to_string());
                }
            }
        }

        Ok(outcome)
    }

    /// Environment for subprocesses.
    ///
    /// When configured: the base environment without ambient profile/config
    /// variables, plus exactly the four credential variables. Otherwise the
    /// unmodified base environment.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env = self.base_env.clone();

        if let Some(creds) = &self.credentials {
            for var in AMBIENT_VARS {
                env.remove(var);
            }
            env.insert(ACCESS_KEY_VAR.to_string(), creds.access_key.clone());
            env.insert(SECRET_KEY_VAR.to_string(), creds.secret_key.clone());
            env.insert(REGION_VAR.to_string(), creds.region.clone());
            env.insert(DEFAULT_REGION_VAR.to_string(), creds.region.clone());
        }

        env
    }

    /// Drop credentials and probe result.
    pub fn clear(&mut self) {
        if self.credentials.take().is_some() {
            info!("Credentials cleared");
        }
        self.identity = None;
    }
}

/// Keep the entries whose name and value are valid Unicode.
fn utf8_env(vars: impl IntoIterator<Item = (OsString, OsString)>) -> HashMap<String, String> {
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (Ok(name), Err(_)) => {
                warn!("Skipping environment variable {} with a non-UTF-8 value", name);
                None
            }
            (Err(name), _) => {
                warn!("Skipping environment variable {:?} with a non-UTF-8 name", name);
                None
            }
        })
        .collect()
}
