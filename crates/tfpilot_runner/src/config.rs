//! Command configuration types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runner-wide options.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Log commands without executing them
    pub dry_run: bool,
    /// Number of trailing output lines kept in exit-code errors
    pub tail_lines: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            tail_lines: 20,
        }
    }
}

impl RunnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }
}

/// A single subprocess invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Binary name or path
    pub binary: PathBuf,
    /// Arguments passed to the binary
    pub args: Vec<String>,
    /// Working directory
    pub workdir: Option<PathBuf>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Whether the parent environment is inherited underneath `env`
    pub inherit_env: bool,
    /// Exit codes that count as success
    pub success_codes: Vec<i32>,
    /// Cancel generation seen when the caller committed to this run. A cancel
    /// issued after it aborts the run even if it lands before the spawn.
    #[serde(default)]
    pub cancel_generation: Option<u64>,
}

impl CommandConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            workdir: None,
            env: HashMap::new(),
            inherit_env: true,
            success_codes: vec![0],
            cancel_generation: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment. The parent environment is not inherited.
    pub fn environment(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self.inherit_env = false;
        self
    }

    pub fn success_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.success_codes = codes.into();
        self
    }

    /// Honour cancels issued after `generation` (see [`crate::CancelHandle::generation`]).
    pub fn cancel_since(mut self, generation: u64) -> Self {
        self.cancel_generation = Some(generation);
        self
    }

    /// Check whether an exit code is accepted as success.
    pub fn accepts(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }

    /// Render the command line for logging.
    pub fn display(&self) -> String {
        let mut cmd = self.binary.to_string_lossy().to_string();
        for arg in &self.args {
            if arg.contains(' ') {
                cmd.push_str(&format!(" '{}'", arg));
            } else {
                cmd.push(' ');
                cmd.push_str(arg);
            }
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_config_builder() {
        let config = CommandConfig::new("terraform")
            .arg("plan")
            .args(["-input=false", "-detailed-exitcode"])
            .workdir("/tmp/project")
            .env("TF_IN_AUTOMATION", "1")
            .success_codes(vec![0, 2]);

        assert_eq!(config.args, vec!["plan", "-input=false", "-detailed-exitcode"]);
        assert_eq!(config.workdir, Some(PathBuf::from("/tmp/project")));
        assert!(config.inherit_env);
        assert_eq!(config.cancel_generation, None);
        assert!(config.accepts(2));
        assert!(!config.accepts(1));
    }

    #[test]
    fn test_environment_disables_inheritance() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        let config = CommandConfig::new("terraform").environment(env);

        assert!(!config.inherit_env);
        assert_eq!(config.env.get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[test]
    fn test_display_quotes_spaces() {
        let config = CommandConfig::new("terraform").args(["apply", "-var=name=a b"]);
        assert_eq!(config.display(), "terraform apply '-var=name=a b'");
    }
}
