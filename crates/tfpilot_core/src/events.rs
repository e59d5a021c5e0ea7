//! Messages exchanged with the engine task.

use std::path::PathBuf;

use tfpilot_iac::{
    AccountIdentity, CredentialSet, PlanSummary, RunResult, StaleSweepReport, VariableSpec,
};

use crate::log::LogEntry;
use crate::workflow::{Step, StepStatus, WorkflowState};

/// Requests from the caller. Processed one at a time, in order.
#[derive(Debug)]
pub enum EngineCommand {
    /// Unpack an archive into a fresh session
    Extract { archive: PathBuf },
    ConfigureCredentials(CredentialSet),
    ClearCredentials,
    /// Parse variable declarations at the provisioning root
    DiscoverVariables,
    /// Copy `terraform.tfvars.example` to `terraform.tfvars` and use it in
    /// place of staged values
    UseExampleValues,
    SetVariable { name: String, value: String },
    /// init, plan, then wait for confirmation if the plan has changes
    StartDeploy,
    /// init, then destroy
    StartDestroy,
    /// Apply the pending plan
    Confirm,
    /// Discard the pending plan
    Decline,
    ExportLogs { path: PathBuf },
    CleanupStale { max_age_hours: u64 },
    /// Forget the finished run
    Reset,
    /// Remove the active session and stop the engine
    Shutdown,
}

/// Notifications to the caller.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Extracted {
        root_path: PathBuf,
        definition_file_count: usize,
    },
    ExtractionFailed {
        error: String,
    },
    CredentialsConfigured {
        identity: Option<AccountIdentity>,
    },
    CredentialsRejected {
        error: String,
    },
    VariablesDiscovered(Vec<VariableSpec>),
    ExampleValuesApplied {
        path: PathBuf,
    },
    LogLine(LogEntry),
    /// Advisory percentage from streamed output
    ProgressHint {
        step: Step,
        percent: u8,
    },
    StepStatus {
        step: Step,
        status: StepStatus,
        progress: u8,
    },
    AwaitingConfirmation(PlanSummary),
    /// Run ended without a failing step
    WorkflowComplete {
        state: WorkflowState,
        results: Vec<RunResult>,
    },
    WorkflowFailed {
        step: Step,
        message: String,
    },
    LogsExported {
        path: PathBuf,
    },
    StaleSweep(StaleSweepReport),
    CommandRejected {
        reason: String,
    },
}
