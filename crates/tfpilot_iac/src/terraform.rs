//! Terraform command invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tfpilot_runner::{CancelHandle, CommandConfig, LogHandler, LogLine, ProcessRunner};

use crate::classifier::{OutputClassifier, Summary, TerraformClassifier};
use crate::error::{IacError, IacResult};

/// Default Terraform binary name, resolved via `PATH`.
pub const DEFAULT_BINARY: &str = "terraform";

/// Plan exit code meaning "succeeded, changes present" under `-detailed-exitcode`.
pub const PLAN_CHANGES_EXIT_CODE: i32 = 2;

/// Terraform subcommands the workflow drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerraformCommand {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl TerraformCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }

    /// Full argument list, subcommand first.
    pub fn args(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            Self::Init => &["-input=false"],
            Self::Plan => &["-input=false", "-detailed-exitcode"],
            Self::Apply | Self::Destroy => &["-auto-approve", "-input=false"],
        };

        std::iter::once(self.as_str())
            .chain(flags.iter().copied())
            .map(String::from)
            .collect()
    }

    /// Whether the subcommand reads variable values.
    pub fn takes_var_file(&self) -> bool {
        !matches!(self, Self::Init)
    }

    /// Exit codes that count as success.
    pub fn success_codes(&self) -> Vec<i32> {
        match self {
            Self::Plan => vec![0, PLAN_CHANGES_EXIT_CODE],
            _ => vec![0],
        }
    }
}

impl std::fmt::Display for TerraformCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one successful Terraform invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub command: TerraformCommand,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub summary: Summary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Receives advisory progress percentages while a command runs.
pub type ProgressHandler = Arc<dyn Fn(TerraformCommand, u8) + Send + Sync>;

/// Per-invocation settings for [`TerraformRunner::run_with`].
#[derive(Clone, Default)]
pub struct RunOptions {
    pub on_line: Option<LogHandler>,
    pub on_progress: Option<ProgressHandler>,
    /// Values file passed as `-var-file` to plan, apply and destroy
    pub var_file: Option<PathBuf>,
    /// Cancel generation observed when the caller committed to the step
    pub cancel_generation: Option<u64>,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Terraform v(\d+\.\d+\.\d+[0-9A-Za-z.+-]*)").expect("valid version regex")
    })
}

/// Version number from `terraform version` output.
pub fn parse_version(output: &str) -> Option<String> {
    version_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Runs Terraform subcommands through a [`ProcessRunner`].
pub struct TerraformRunner {
    runner: Arc<dyn ProcessRunner>,
    binary: PathBuf,
    classifier: Arc<dyn OutputClassifier>,
}

impl TerraformRunner {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            binary: PathBuf::from(DEFAULT_BINARY),
            classifier: Arc::new(TerraformClassifier),
        }
    }

    /// Use a specific Terraform binary (name or path).
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn OutputClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Check whether the Terraform binary can be resolved.
    pub async fn is_available(&self) -> bool {
        self.runner.is_available(&self.binary).await
    }

    /// Handle that kills the command currently running.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.runner.cancel_handle()
    }

    /// Installed Terraform version, such as `1.6.3`.
    pub async fn version(&self) -> IacResult<String> {
        let config = CommandConfig::new(&self.binary).arg("version");
        let result = self.runner.run(&config, None).await?;
        parse_version(&result.stdout).ok_or_else(|| {
            let first = result.stdout.lines().next().unwrap_or_default().trim();
            IacError::VersionUnknown(first.to_string())
        })
    }

    /// Run `command` in `root` with exactly `env` as the environment.
    ///
    /// Each output line goes to `on_line`; lines that match a progress
    /// milestone also go to `on_progress`. Non-success exit codes surface
    /// as [`tfpilot_runner::RunnerError::ExitCode`].
    pub async fn run(
        &self,
        command: TerraformCommand,
        root: &Path,
        env: HashMap<String, String>,
        on_line: Option<LogHandler>,
        on_progress: Option<ProgressHandler>,
    ) -> IacResult<RunResult> {
        let options = RunOptions {
            on_line,
            on_progress,
            ..RunOptions::default()
        };
        self.run_with(command, root, env, options).await
    }

    /// Like [`TerraformRunner::run`], with a values file and cancel generation.
    ///
    /// `init` ignores the values file.
    pub async fn run_with(
        &self,
        command: TerraformCommand,
        root: &Path,
        env: HashMap<String, String>,
        options: RunOptions,
    ) -> IacResult<RunResult> {
        info!("Running terraform {} in {:?}", command, root);

        let mut args = command.args();
        if let Some(file) = options.var_file.as_ref().filter(|_| command.takes_var_file()) {
            args.push(format!("-var-file={}", file.display()));
        }

        let mut config = CommandConfig::new(&self.binary)
            .args(args)
            .workdir(root)
            .environment(env)
            .success_codes(command.success_codes());
        if let Some(generation) = options.cancel_generation {
            config = config.cancel_since(generation);
        }

        let handler = self.line_handler(command, options.on_line, options.on_progress);
        let result = self.runner.run(&config, handler).await?;

        let mut summary = self.classifier.classify(command, &result.stdout);
        if let Summary::Plan(plan) = &mut summary {
            // The exit code wins over the text when they disagree.
            if result.exit_code == PLAN_CHANGES_EXIT_CODE {
                plan.has_changes = true;
            }
        }

        debug!(
            "terraform {} exited with {} after {}ms",
            command, result.exit_code, result.duration_ms
        );

        Ok(RunResult {
            command,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            summary,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms,
        })
    }

    fn line_handler(
        &self,
        command: TerraformCommand,
        on_line: Option<LogHandler>,
        on_progress: Option<ProgressHandler>,
    ) -> Option<LogHandler> {
        if on_line.is_none() && on_progress.is_none() {
            return None;
        }

        let classifier = Arc::clone(&self.classifier);
        let handler: LogHandler = Arc::new(move |line: LogLine| {
            if let Some(progress) = &on_progress {
                if let Some(percent) = classifier.progress_hint(command, &line.message) {
                    progress(command, percent);
                }
            }
            if let Some(on_line) = &on_line {
                on_line(line);
            }
        });
        Some(handler)
    }
}
