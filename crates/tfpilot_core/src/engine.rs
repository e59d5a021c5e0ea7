//! Orchestration engine.
//!
//! The engine owns the workspace, credentials, variables and the current
//! workflow run. It runs as a single task: commands come in over one
//! channel, events go out over another, and every state change happens on
//! that task. Output lines streamed by the runner's reader tasks are
//! forwarded over an internal channel and applied between polls of the
//! subprocess future.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tfpilot_iac::variables;
use tfpilot_iac::{
    CredentialContext, IacError, ProgressHandler, RunOptions, RunResult, TerraformCommand,
    TerraformRunner, VariableSet, WorkspaceManager,
};
use tfpilot_runner::{CancelHandle, LogHandler, LogLine, ProcessRunner, RunnerError};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineCommand, EngineEvent};
use crate::log::{self, LogEntry, LogFormat};
use crate::workflow::{Step, WorkflowKind, WorkflowRun, WorkflowState};

const COMMAND_BUFFER: usize = 32;

/// Output of a running step, sent from reader tasks to the engine task.
enum StepSignal {
    Line(LogLine),
    Progress(u8),
}

pub struct Engine {
    config: EngineConfig,
    workspace: WorkspaceManager,
    credentials: CredentialContext,
    variables: VariableSet,
    /// Copied example values, used instead of staged ones
    example_values: Option<PathBuf>,
    /// `-var-file` for the current run
    var_file: Option<PathBuf>,
    terraform: Arc<TerraformRunner>,
    run: Option<WorkflowRun>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Create an engine and the receiving end of its event stream.
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn ProcessRunner>,
        credentials: CredentialContext,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let terraform = TerraformRunner::new(runner).with_binary(config.terraform_binary.clone());

        let engine = Self {
            workspace: WorkspaceManager::new(config.base_dir.clone()),
            config,
            credentials,
            variables: VariableSet::default(),
            example_values: None,
            var_file: None,
            terraform: Arc::new(terraform),
            run: None,
            events,
        };
        (engine, events_rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self) -> Option<&WorkflowRun> {
        self.run.as_ref()
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    pub fn variables(&self) -> &VariableSet {
        &self.variables
    }

    /// Handle that kills the subprocess of the running step.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.terraform.cancel_handle()
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> EngineHandle {
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = self.cancel_handle();
        let task = tokio::spawn(self.serve(commands_rx));

        EngineHandle {
            commands,
            cancel,
            task,
        }
    }

    /// Process commands until `Shutdown` or until every sender is gone.
    pub async fn serve(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        info!("Engine started");

        while let Some(command) = commands.recv().await {
            if matches!(command, EngineCommand::Shutdown) {
                break;
            }
            self.handle(command).await;
        }

        self.shutdown();
        info!("Engine stopped");
    }

    /// Process one command to completion.
    pub async fn handle(&mut self, command: EngineCommand) {
        debug!("Handling {:?}", command);

        match command {
            EngineCommand::Extract { archive } => self.extract(archive),
            EngineCommand::ConfigureCredentials(set) => {
                match self.credentials.configure(set).await {
                    Ok(outcome) => {
                        if let Some(warning) = outcome.warning {
                            self.record(LogEntry::warn(format!(
                                "Credentials stored but identity check failed: {}",
                                warning
                            )));
                        }
                        self.emit(EngineEvent::CredentialsConfigured {
                            identity: outcome.identity,
                        });
                    }
                    Err(e) => self.emit(EngineEvent::CredentialsRejected {
                        error: e.to_string(),
                    }),
                }
            }
            EngineCommand::ClearCredentials => self.credentials.clear(),
            EngineCommand::DiscoverVariables => {
                if let Err(e) = self.discover_variables() {
                    self.reject(e);
                }
            }
            EngineCommand::UseExampleValues => {
                if let Err(e) = self.use_example_values() {
                    self.reject(e);
                }
            }
            EngineCommand::SetVariable { name, value } => {
                if let Some(path) = &self.example_values {
                    let reason = format!("Values come from {}", path.display());
                    self.reject_text(reason);
                } else if !self.variables.set(&name, value) {
                    self.emit(EngineEvent::CommandRejected {
                        reason: format!("Unknown variable: {}", name),
                    });
                }
            }
            EngineCommand::StartDeploy => self.start(WorkflowKind::Deploy).await,
            EngineCommand::StartDestroy => self.start(WorkflowKind::Destroy).await,
            EngineCommand::Confirm => {
                match self.run.as_mut().map(|run| run.confirm()) {
                    Some(Ok(())) => self.advance().await,
                    Some(Err(e)) => self.reject(e),
                    None => self.reject_text("No plan awaiting confirmation"),
                }
            }
            EngineCommand::Decline => match self.run.as_mut().map(|run| run.decline()) {
                Some(Ok(())) => {
                    self.record(LogEntry::info("Plan declined, nothing applied"));
                    self.finish();
                }
                Some(Err(e)) => self.reject(e),
                None => self.reject_text("No plan awaiting confirmation"),
            },
            EngineCommand::ExportLogs { path } => {
                let entries = self.run.as_ref().map(|r| r.logs.as_slice()).unwrap_or(&[]);
                match log::export(entries, &path, LogFormat::from_path(&path)) {
                    Ok(()) => self.emit(EngineEvent::LogsExported { path }),
                    Err(e) => self.reject(e),
                }
            }
            EngineCommand::CleanupStale { max_age_hours } => {
                let report = self.workspace.cleanup_stale(max_age_hours);
                self.emit(EngineEvent::StaleSweep(report));
            }
            EngineCommand::Reset => {
                let busy = self.run.as_ref().map(|r| r.state).filter(|state| {
                    !state.is_terminal() && *state != WorkflowState::AwaitingConfirmation
                });
                match busy {
                    Some(state) => self.reject(CoreError::WorkflowInProgress(state)),
                    None => {
                        self.run = None;
                        debug!("Workflow run reset");
                    }
                }
            }
            EngineCommand::Shutdown => self.shutdown(),
        }
    }

    fn extract(&mut self, archive: PathBuf) {
        if let Err(e) = self.ensure_idle() {
            self.reject(e);
            return;
        }

        self.run = None;
        self.variables = VariableSet::default();
        self.example_values = None;

        match self.workspace.extract(&archive) {
            Ok(session) => {
                let event = EngineEvent::Extracted {
                    root_path: session.root.clone(),
                    definition_file_count: session.definition_file_count(),
                };
                self.emit(event);
            }
            Err(e) => {
                error!("Extraction of {:?} failed: {}", archive, e);
                self.emit(EngineEvent::ExtractionFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    fn discover_variables(&mut self) -> CoreResult<()> {
        let root = self.session_root()?;
        self.variables = VariableSet::new(variables::discover(&root)?);
        self.emit(EngineEvent::VariablesDiscovered(
            self.variables.as_slice().to_vec(),
        ));
        Ok(())
    }

    fn use_example_values(&mut self) -> CoreResult<()> {
        self.ensure_idle()?;
        let root = self.session_root()?;
        let path = variables::copy_example(&root)?;
        self.record(LogEntry::info(format!("Using values from {}", path.display())));
        self.example_values = Some(path.clone());
        self.emit(EngineEvent::ExampleValuesApplied { path });
        Ok(())
    }

    fn ensure_idle(&self) -> CoreResult<()> {
        match &self.run {
            Some(run) if !run.is_terminal() => Err(CoreError::WorkflowInProgress(run.state)),
            _ => Ok(()),
        }
    }

    fn session_root(&self) -> CoreResult<PathBuf> {
        self.workspace
            .active()
            .map(|s| s.root.clone())
            .ok_or(CoreError::NoSession)
    }

    /// Check preconditions shared by deploy and destroy.
    fn preflight(&self) -> CoreResult<PathBuf> {
        self.ensure_idle()?;
        let root = self.session_root()?;
        if !self.credentials.is_configured() {
            return Err(CoreError::CredentialsMissing);
        }
        let missing = match self.example_values {
            Some(_) => Vec::new(),
            None => self.variables.missing(),
        };
        if !missing.is_empty() {
            return Err(CoreError::MissingVariables(
                missing.into_iter().map(String::from).collect(),
            ));
        }
        Ok(root)
    }

    async fn start(&mut self, kind: WorkflowKind) {
        let root = match self.preflight() {
            Ok(root) => root,
            Err(e) => {
                self.reject(e);
                return;
            }
        };

        let mut run = WorkflowRun::new(kind);
        info!("Starting {:?} workflow {} in {:?}", kind, run.id, root);
        if let Err(e) = run.start() {
            self.reject(e);
            return;
        }
        self.run = Some(run);

        match self.stage_values(&root) {
            Ok(var_file) => self.var_file = var_file,
            Err(e) => {
                self.fail_active(e.to_string());
                self.finish();
                return;
            }
        }

        self.advance().await;
    }

    /// Write the values file for a new run and return its `-var-file`, if
    /// Terraform would not pick it up on its own.
    fn stage_values(&mut self, root: &Path) -> Result<Option<PathBuf>, IacError> {
        if self.example_values.is_some() {
            return Ok(None);
        }

        // Values are written fresh for every run.
        let values_file = PathBuf::from(&self.config.values_file);
        match variables::materialize_to(&root.join(&values_file), self.variables.as_slice())? {
            Some(path) => {
                self.record(LogEntry::info(format!("Wrote {}", path.display())));
                Ok((!variables::is_auto_loaded(&values_file)).then_some(values_file))
            }
            None => Ok(None),
        }
    }

    /// Run steps until the workflow waits for the operator or ends.
    async fn advance(&mut self) {
        loop {
            let Some(state) = self.run.as_ref().map(|r| r.state) else {
                return;
            };

            if let Some(step) = state.active_step() {
                self.execute_step(step).await;
                continue;
            }

            match state {
                WorkflowState::AwaitingConfirmation => {
                    let summary = self
                        .run
                        .as_ref()
                        .and_then(|r| r.plan_summary().copied())
                        .unwrap_or_default();
                    self.record(LogEntry::info(format!(
                        "Plan: {}. Waiting for confirmation",
                        summary
                    )));
                    self.emit(EngineEvent::AwaitingConfirmation(summary));
                }
                _ if state.is_terminal() => self.finish(),
                _ => warn!("Workflow stalled in {:?}", state),
            }
            return;
        }
    }

    async fn execute_step(&mut self, step: Step) {
        // Cancels from here on belong to this step.
        let generation = self.terraform.cancel_handle().generation();

        let root = match self.session_root() {
            Ok(root) => root,
            Err(e) => {
                self.fail_active(e.to_string());
                return;
            }
        };

        self.emit_step(step);
        self.record(LogEntry::info(format!("Running terraform {}", step)));

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let on_line: LogHandler = {
            let tx = signal_tx.clone();
            Arc::new(move |line: LogLine| {
                let _ = tx.send(StepSignal::Line(line));
            })
        };
        let on_progress: ProgressHandler =
            Arc::new(move |_: TerraformCommand, percent: u8| {
                let _ = signal_tx.send(StepSignal::Progress(percent));
            });

        let terraform = Arc::clone(&self.terraform);
        let env = self.credentials.environment();
        let options = RunOptions {
            on_line: Some(on_line),
            on_progress: Some(on_progress),
            var_file: self.var_file.clone(),
            cancel_generation: Some(generation),
        };
        let execution = terraform.run_with(step.command(), &root, env, options);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                Some(signal) = signal_rx.recv() => self.apply_signal(step, signal),
            }
        };
        while let Ok(signal) = signal_rx.try_recv() {
            self.apply_signal(step, signal);
        }

        self.settle_step(step, outcome);
    }

    fn apply_signal(&mut self, step: Step, signal: StepSignal) {
        match signal {
            StepSignal::Line(line) => self.record(LogEntry::from_line(&line)),
            StepSignal::Progress(percent) => {
                self.emit(EngineEvent::ProgressHint { step, percent })
            }
        }
    }

    fn settle_step(&mut self, step: Step, outcome: Result<RunResult, IacError>) {
        match outcome {
            Ok(result) => {
                let exit_code = result.exit_code;
                let transition = match self.run.as_mut() {
                    Some(run) => run.complete_step(result),
                    None => return,
                };
                match transition {
                    Ok(()) => {
                        self.record(LogEntry::info(format!(
                            "terraform {} finished with exit code {}",
                            step, exit_code
                        )));
                        self.emit_step(step);
                    }
                    Err(e) => self.fail_active(e.to_string()),
                }
            }
            Err(IacError::Runner(RunnerError::Cancelled)) => {
                warn!("terraform {} was cancelled", step);
                if let Some(run) = self.run.as_mut() {
                    let _ = run.cancel();
                }
                self.record(LogEntry::warn(format!("terraform {} cancelled", step)));
                self.emit_step(step);
            }
            Err(e) => {
                let message = format!("terraform {} failed: {}", step, e);
                self.fail_active(message);
            }
        }
    }

    /// Fail the running step and publish the failure.
    fn fail_active(&mut self, message: String) {
        error!("{}", message);
        self.record(LogEntry::error(message.clone()));

        let step = self.run.as_ref().and_then(|r| r.state.active_step());
        if let Some(run) = self.run.as_mut() {
            if let Err(e) = run.fail_step(message) {
                warn!("Could not mark failure: {}", e);
            }
        }
        if let Some(step) = step {
            self.emit_step(step);
        }
    }

    /// Publish the terminal state of the current run.
    fn finish(&mut self) {
        let Some(run) = &self.run else {
            return;
        };

        let event = match run.state {
            WorkflowState::Failed(step) => EngineEvent::WorkflowFailed {
                step,
                message: run.error.clone().unwrap_or_default(),
            },
            state => EngineEvent::WorkflowComplete {
                state,
                results: run.results.clone(),
            },
        };
        self.emit(event);
    }

    fn emit_step(&self, step: Step) {
        if let Some(run) = &self.run {
            if let Some(status) = run.step_status(step) {
                self.emit(EngineEvent::StepStatus {
                    step,
                    status,
                    progress: run.progress,
                });
            }
        }
    }

    /// Append to the run log (when a run exists) and publish the entry.
    fn record(&mut self, entry: LogEntry) {
        debug!(target: "tfpilot::run", "[{}] {}", entry.level, entry.message);
        if let Some(run) = self.run.as_mut() {
            run.log(entry.clone());
        }
        self.emit(EngineEvent::LogLine(entry));
    }

    fn reject(&self, error: impl std::fmt::Display) {
        self.reject_text(error.to_string());
    }

    fn reject_text(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Command rejected: {}", reason);
        self.emit(EngineEvent::CommandRejected { reason });
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        self.credentials.clear();
        if let Err(e) = self.workspace.cleanup_active() {
            warn!("Failed to remove session on shutdown: {}", e);
        }
    }
}

/// Caller side of a spawned [`Engine`].
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> CoreResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoreError::EngineStopped)
    }

    /// Kill the running subprocess. Queued commands are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the engine and wait for it to clean up.
    pub async fn shutdown(self) -> CoreResult<()> {
        // A stopped engine already cleaned up
        let _ = self.commands.send(EngineCommand::Shutdown).await;
        self.task.await.map_err(|_| CoreError::EngineStopped)
    }
}
