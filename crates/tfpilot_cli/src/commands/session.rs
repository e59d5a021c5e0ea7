//! One engine session, driven over its command and event channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tfpilot_core::{
    Engine, EngineCommand, EngineConfig, EngineEvent, EngineHandle, LogLevel, StepStatus,
    WorkflowState,
};
use tfpilot_iac::{
    AwsCliProbe, CredentialContext, CredentialSet, PlanSummary, RunResult, StaleSweepReport,
    TerraformRunner, VariableSpec,
};
use tfpilot_runner::{ProcessRunner, RunnerOptions, TokioRunner};

use super::CliFailure;

/// How the plan gate is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Ask on the terminal
    Prompt,
    /// Confirm without asking
    Auto,
}

/// Result of a finished workflow.
#[derive(Debug)]
pub enum Finish {
    Succeeded {
        state: WorkflowState,
        results: Vec<RunResult>,
    },
    Failed(CliFailure),
}

impl Finish {
    pub fn into_result(self) -> Result<(WorkflowState, Vec<RunResult>)> {
        match self {
            Finish::Succeeded { state, results } => Ok((state, results)),
            Finish::Failed(failure) => Err(failure.into()),
        }
    }
}

pub struct EngineSession {
    handle: EngineHandle,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    quiet: bool,
}

impl EngineSession {
    /// Spawn an engine.
    ///
    /// With `require_terraform` the configured binary must resolve, and its
    /// version is reported.
    pub async fn start(config: EngineConfig, quiet: bool, require_terraform: bool) -> Result<Self> {
        let options = if config.dry_run {
            RunnerOptions::new().dry_run()
        } else {
            RunnerOptions::new()
        };
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioRunner::new(options));

        if require_terraform {
            if !runner.is_available(&config.terraform_binary).await {
                return Err(CliFailure::BinaryNotFound(
                    config.terraform_binary.display().to_string(),
                )
                .into());
            }
            if !config.dry_run {
                report_version(runner.clone(), &config).await;
            }
        }

        let mut credentials = CredentialContext::new();
        if config.probe_identity && !config.dry_run {
            let probe = AwsCliProbe::new(runner.clone());
            match probe.version().await {
                Ok(version) => println!("🔧 AWS CLI v{}", version),
                Err(e) => warn!("Could not determine AWS CLI version: {}", e),
            }
            credentials = credentials.with_probe(Arc::new(probe));
        }

        let (engine, events) = Engine::new(config, runner, credentials);
        Ok(Self {
            handle: engine.spawn(),
            events,
            quiet,
        })
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.handle.send(command).await.context("Engine stopped unexpectedly")
    }

    async fn next_event(&mut self) -> Result<EngineEvent> {
        self.events
            .recv()
            .await
            .ok_or_else(|| anyhow!("Engine stopped unexpectedly"))
    }

    /// Wait for the event `pick` accepts, rendering everything else.
    async fn wait_for<T>(
        &mut self,
        mut pick: impl FnMut(EngineEvent) -> Result<Option<T>, EngineEvent>,
    ) -> Result<T> {
        loop {
            let event = self.next_event().await?;
            match pick(event) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(EngineEvent::CommandRejected { reason }) => {
                    return Err(CliFailure::Rejected(reason).into());
                }
                Err(other) => self.render(&other),
            }
        }
    }

    /// Unpack `archive` and return the provisioning root.
    pub async fn extract(&mut self, archive: &Path) -> Result<PathBuf> {
        self.send(EngineCommand::Extract {
            archive: archive.to_path_buf(),
        })
        .await?;

        let (root, count) = self
            .wait_for(|event| match event {
                EngineEvent::Extracted {
                    root_path,
                    definition_file_count,
                } => Ok(Some(Ok((root_path, definition_file_count)))),
                EngineEvent::ExtractionFailed { error } => Ok(Some(Err(error))),
                other => Err(other),
            })
            .await?
            .map_err(|error| CliFailure::InvalidArgs(format!("Cannot use archive: {}", error)))?;

        println!("📦 Extracted {} definition file(s)", count);
        debug!("Provisioning root: {:?}", root);
        Ok(root)
    }

    pub async fn configure_credentials(&mut self, set: CredentialSet) -> Result<()> {
        self.send(EngineCommand::ConfigureCredentials(set)).await?;

        let identity = self
            .wait_for(|event| match event {
                EngineEvent::CredentialsConfigured { identity } => Ok(Some(Ok(identity))),
                EngineEvent::CredentialsRejected { error } => Ok(Some(Err(error))),
                other => Err(other),
            })
            .await?
            .map_err(CliFailure::InvalidArgs)?;

        match identity {
            Some(identity) => println!(
                "🔑 Authenticated as {} (account {})",
                identity.arn, identity.account
            ),
            None => println!("🔑 Credentials configured"),
        }
        Ok(())
    }

    pub async fn discover_variables(&mut self) -> Result<Vec<VariableSpec>> {
        self.send(EngineCommand::DiscoverVariables).await?;
        self.wait_for(|event| match event {
            EngineEvent::VariablesDiscovered(vars) => Ok(Some(vars)),
            other => Err(other),
        })
        .await
    }

    /// Copy the archive's example values into place instead of staging any.
    pub async fn use_example_values(&mut self) -> Result<()> {
        self.send(EngineCommand::UseExampleValues).await?;
        let path = self
            .wait_for(|event| match event {
                EngineEvent::ExampleValuesApplied { path } => Ok(Some(path)),
                other => Err(other),
            })
            .await
            .map_err(|e| match e.downcast::<CliFailure>() {
                Ok(CliFailure::Rejected(reason)) => CliFailure::InvalidArgs(reason).into(),
                Ok(other) => other.into(),
                Err(e) => e,
            })?;
        println!("📝 Using example values ({})", path.display());
        Ok(())
    }

    /// Stage `values` against the discovered declarations.
    ///
    /// Unknown names and required variables left without a value are
    /// argument errors.
    pub async fn stage_variables(
        &mut self,
        declared: &[VariableSpec],
        values: &[(String, String)],
    ) -> Result<()> {
        for (name, _) in values {
            if !declared.iter().any(|v| &v.name == name) {
                return Err(
                    CliFailure::InvalidArgs(format!("Unknown variable: {}", name)).into(),
                );
            }
        }

        let missing: Vec<&str> = declared
            .iter()
            .filter(|v| v.is_required())
            .filter(|v| !values.iter().any(|(n, value)| n == &v.name && !value.is_empty()))
            .map(|v| v.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CliFailure::InvalidArgs(format!(
                "Missing values for required variables: {} (pass --var NAME=VALUE)",
                missing.join(", ")
            ))
            .into());
        }

        for (name, value) in values {
            self.send(EngineCommand::SetVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .await?;
        }
        Ok(())
    }

    /// Start a workflow and follow it to its end.
    ///
    /// Ctrl-C stops the running subprocess.
    pub async fn run_workflow(&mut self, start: EngineCommand, approval: Approval) -> Result<Finish> {
        self.send(start).await?;

        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        let mut interrupted = false;
        let mut declined = false;

        loop {
            let event = tokio::select! {
                event = self.events.recv() => {
                    event.ok_or_else(|| anyhow!("Engine stopped unexpectedly"))?
                }
                _ = &mut interrupt, if !interrupted => {
                    eprintln!("⚠️  Interrupted, stopping terraform...");
                    interrupted = true;
                    self.handle.cancel();
                    continue;
                }
            };

            match event {
                EngineEvent::AwaitingConfirmation(plan) => {
                    if approve(&plan, approval).await? {
                        self.send(EngineCommand::Confirm).await?;
                    } else {
                        declined = true;
                        self.send(EngineCommand::Decline).await?;
                    }
                }
                EngineEvent::WorkflowComplete { state, results } => {
                    return Ok(match state {
                        WorkflowState::Cancelled if declined => Finish::Failed(CliFailure::Declined),
                        WorkflowState::Cancelled => Finish::Failed(CliFailure::Interrupted),
                        state => Finish::Succeeded { state, results },
                    });
                }
                EngineEvent::WorkflowFailed { step, message } => {
                    return Ok(Finish::Failed(CliFailure::Workflow { step, message }));
                }
                EngineEvent::CommandRejected { reason } => {
                    return Err(CliFailure::Rejected(reason).into());
                }
                other => self.render(&other),
            }
        }
    }

    pub async fn export_logs(&mut self, path: &Path) -> Result<()> {
        self.send(EngineCommand::ExportLogs {
            path: path.to_path_buf(),
        })
        .await?;
        self.wait_for(|event| match event {
            EngineEvent::LogsExported { .. } => Ok(Some(())),
            other => Err(other),
        })
        .await
    }

    /// Remove sessions older than `max_age_hours`.
    pub async fn sweep(&mut self, max_age_hours: u64) -> Result<StaleSweepReport> {
        self.send(EngineCommand::CleanupStale { max_age_hours }).await?;
        let report = self
            .wait_for(|event| match event {
                EngineEvent::StaleSweep(report) => Ok(Some(report)),
                other => Err(other),
            })
            .await?;
        self.render(&EngineEvent::StaleSweep(report.clone()));
        Ok(report)
    }

    /// Stop the engine, removing the session workspace.
    pub async fn close(self) -> Result<()> {
        let Self {
            handle,
            mut events,
            quiet,
        } = self;
        handle.shutdown().await?;
        while let Ok(event) = events.try_recv() {
            render(&event, quiet);
        }
        Ok(())
    }

    fn render(&self, event: &EngineEvent) {
        render(event, self.quiet);
    }
}

fn render(event: &EngineEvent, quiet: bool) {
    match event {
        EngineEvent::LogLine(entry) => {
            if quiet {
                return;
            }
            match entry.level {
                LogLevel::Error => eprintln!("   {}", entry.message),
                _ => println!("   {}", entry.message),
            }
        }
        EngineEvent::StepStatus { step, status, progress } => match status {
            StepStatus::Active => println!("▶️  terraform {} [{}%]", step, progress),
            StepStatus::Completed => println!("✅ terraform {} done [{}%]", step, progress),
            StepStatus::Error => println!("❌ terraform {} failed", step),
            StepStatus::Pending => {}
        },
        EngineEvent::ProgressHint { step, percent } => {
            debug!("{} progress hint: {}%", step, percent);
        }
        EngineEvent::StaleSweep(report) => {
            if !report.removed.is_empty() {
                println!("🧹 Removed {} stale session(s)", report.removed.len());
            }
            for (path, error) in &report.failed {
                warn!("Could not remove stale session {:?}: {}", path, error);
            }
        }
        EngineEvent::LogsExported { path } => {
            println!("📄 Logs written to {}", path.display());
        }
        other => debug!("Unhandled event: {:?}", other),
    }
}

async fn report_version(runner: Arc<dyn ProcessRunner>, config: &EngineConfig) {
    let terraform = TerraformRunner::new(runner).with_binary(config.terraform_binary.clone());
    match terraform.version().await {
        Ok(version) => {
            info!("Using {:?}", config.terraform_binary);
            println!("🔧 Terraform v{}", version);
        }
        Err(e) => warn!("Could not determine Terraform version: {}", e),
    }
}

async fn approve(plan: &PlanSummary, approval: Approval) -> Result<bool> {
    println!();
    println!("📋 Plan: {}", plan);

    if approval == Approval::Auto {
        println!("   Auto-approved (--yes)");
        return Ok(true);
    }

    let answer = tokio::task::spawn_blocking(|| {
        use std::io::Write;
        print!("   Apply these changes? [y/N] ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>(line)
    })
    .await?
    .context("Failed to read confirmation")?;

    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfpilot_core::Step;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes("  YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
        assert!(!is_yes("yep"));
    }

    #[test]
    fn test_finish_into_result() {
        let ok = Finish::Succeeded {
            state: WorkflowState::NoChangesComplete,
            results: Vec::new(),
        };
        assert_eq!(ok.into_result().unwrap().0, WorkflowState::NoChangesComplete);

        let failed = Finish::Failed(CliFailure::Workflow {
            step: Step::Plan,
            message: "Error: Invalid provider".to_string(),
        });
        let err = failed.into_result().unwrap_err();
        assert!(err.to_string().contains("terraform plan failed"));
        assert!(matches!(
            err.downcast_ref::<CliFailure>(),
            Some(CliFailure::Workflow { step: Step::Plan, .. })
        ));
    }
}
