//! Workflow state machine.
//!
//! A deploy run moves through
//!
//! ```text
//! Idle -> Initializing -> Planning -> AwaitingConfirmation -> Applying -> Complete
//!                                  \-> NoChangesComplete
//! ```
//!
//! and a destroy run through `Idle -> Initializing -> Destroying -> DestroyComplete`.
//! Any step can end in `Failed(step)`; a declined plan or a killed process
//! ends in `Cancelled`. Terminal states are final: a new run starts from
//! scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use tfpilot_iac::{PlanSummary, RunResult, TerraformCommand};

use crate::error::{CoreError, CoreResult};
use crate::log::LogEntry;

/// A Terraform step of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl Step {
    pub fn command(&self) -> TerraformCommand {
        match self {
            Self::Init => TerraformCommand::Init,
            Self::Plan => TerraformCommand::Plan,
            Self::Apply => TerraformCommand::Apply,
            Self::Destroy => TerraformCommand::Destroy,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Error,
}

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Deploy,
    Destroy,
}

impl WorkflowKind {
    fn steps(&self) -> &'static [Step] {
        match self {
            Self::Deploy => &[Step::Init, Step::Plan, Step::Apply],
            Self::Destroy => &[Step::Init, Step::Destroy],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Initializing,
    Planning,
    AwaitingConfirmation,
    Applying,
    NoChangesComplete,
    Complete,
    Destroying,
    DestroyComplete,
    Failed(Step),
    Cancelled,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Idle
    }
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoChangesComplete
                | Self::Complete
                | Self::DestroyComplete
                | Self::Failed(_)
                | Self::Cancelled
        )
    }

    /// Terminal and successful.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::NoChangesComplete | Self::Complete | Self::DestroyComplete
        )
    }

    /// Step whose subprocess runs in this state.
    pub fn active_step(&self) -> Option<Step> {
        match self {
            Self::Initializing => Some(Step::Init),
            Self::Planning => Some(Step::Plan),
            Self::Applying => Some(Step::Apply),
            Self::Destroying => Some(Step::Destroy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
}

/// One end-to-end execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    pub steps: Vec<StepRecord>,
    /// Coarse display percentage, never decreases
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub results: Vec<RunResult>,
    /// Failure message including the tool's output tail
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(kind: WorkflowKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: WorkflowState::Idle,
            steps: kind
                .steps()
                .iter()
                .map(|&step| StepRecord {
                    step,
                    status: StepStatus::Pending,
                })
                .collect(),
            progress: 0,
            started_at: Utc::now(),
            finished_at: None,
            logs: Vec::new(),
            results: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn step_status(&self, step: Step) -> Option<StepStatus> {
        self.steps.iter().find(|r| r.step == step).map(|r| r.status)
    }

    /// Summary of the plan step, once it ran.
    pub fn plan_summary(&self) -> Option<&PlanSummary> {
        self.results.iter().find_map(|r| r.summary.plan())
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    /// `Idle -> Initializing`.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.state != WorkflowState::Idle {
            return Err(self.invalid("start"));
        }
        self.enter(WorkflowState::Initializing);
        self.set_progress(5);
        Ok(())
    }

    /// Record a successful step and advance.
    pub fn complete_step(&mut self, result: RunResult) -> CoreResult<()> {
        let step = match self.state.active_step() {
            Some(step) if step.command() == result.command => step,
            _ => return Err(self.invalid("complete step")),
        };

        self.set_status(step, StepStatus::Completed);
        let has_changes = result.summary.plan().map_or(false, |p| p.has_changes);
        self.results.push(result);

        match (self.kind, step) {
            (WorkflowKind::Deploy, Step::Init) => {
                self.set_progress(30);
                self.enter(WorkflowState::Planning);
            }
            (WorkflowKind::Destroy, Step::Init) => {
                self.set_progress(40);
                self.enter(WorkflowState::Destroying);
            }
            (_, Step::Plan) if has_changes => {
                self.set_progress(60);
                self.enter(WorkflowState::AwaitingConfirmation);
            }
            (_, Step::Plan) => {
                self.set_progress(100);
                self.enter(WorkflowState::NoChangesComplete);
            }
            (_, Step::Apply) => {
                self.set_progress(100);
                self.enter(WorkflowState::Complete);
            }
            (_, Step::Destroy) => {
                self.set_progress(100);
                self.enter(WorkflowState::DestroyComplete);
            }
        }
        Ok(())
    }

    /// Mark the running step as failed. Terminal.
    pub fn fail_step(&mut self, message: impl Into<String>) -> CoreResult<()> {
        let step = self
            .state
            .active_step()
            .ok_or_else(|| self.invalid("fail step"))?;

        self.set_status(step, StepStatus::Error);
        self.error = Some(message.into());
        self.enter(WorkflowState::Failed(step));
        Ok(())
    }

    /// `AwaitingConfirmation -> Applying`.
    pub fn confirm(&mut self) -> CoreResult<()> {
        if self.state != WorkflowState::AwaitingConfirmation {
            return Err(self.invalid("confirm"));
        }
        self.enter(WorkflowState::Applying);
        Ok(())
    }

    /// `AwaitingConfirmation -> Cancelled`.
    pub fn decline(&mut self) -> CoreResult<()> {
        if self.state != WorkflowState::AwaitingConfirmation {
            return Err(self.invalid("decline"));
        }
        self.enter(WorkflowState::Cancelled);
        Ok(())
    }

    /// Abort from any non-terminal state; a running step is marked as errored.
    pub fn cancel(&mut self) -> CoreResult<()> {
        if self.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        if let Some(step) = self.state.active_step() {
            self.set_status(step, StepStatus::Error);
        }
        self.enter(WorkflowState::Cancelled);
        Ok(())
    }

    fn enter(&mut self, state: WorkflowState) {
        debug!("Workflow {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;

        if let Some(step) = state.active_step() {
            self.set_status(step, StepStatus::Active);
        }
        if state.is_terminal() {
            self.finished_at = Some(Utc::now());
            info!("Workflow {} finished: {:?}", self.id, state);
        }
    }

    fn set_status(&mut self, step: Step, status: StepStatus) {
        if let Some(record) = self.steps.iter_mut().find(|r| r.step == step) {
            record.status = status;
        }
    }

    fn set_progress(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }

    fn invalid(&self, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            from: self.state,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfpilot_iac::{ApplySummary, DestroySummary, Summary};

    fn result(command: TerraformCommand, exit_code: i32, summary: Summary) -> RunResult {
        let now = Utc::now();
        RunResult {
            command,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            summary,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    fn init_ok() -> RunResult {
        result(TerraformCommand::Init, 0, Summary::Init { success: true })
    }

    fn plan(has_changes: bool) -> RunResult {
        let summary = if has_changes {
            PlanSummary::new(1, 0, 0)
        } else {
            PlanSummary::default()
        };
        result(
            TerraformCommand::Plan,
            if has_changes { 2 } else { 0 },
            Summary::Plan(summary),
        )
    }

    #[test]
    fn test_deploy_with_changes() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        run.start().unwrap();
        assert_eq!(run.state, WorkflowState::Initializing);
        assert_eq!(run.step_status(Step::Init), Some(StepStatus::Active));

        run.complete_step(init_ok()).unwrap();
        assert_eq!(run.state, WorkflowState::Planning);

        run.complete_step(plan(true)).unwrap();
        assert_eq!(run.state, WorkflowState::AwaitingConfirmation);
        assert_eq!(run.step_status(Step::Apply), Some(StepStatus::Pending));

        // Apply needs a confirmation first
        let apply = result(TerraformCommand::Apply, 0, Summary::Apply(ApplySummary::default()));
        assert!(run.complete_step(apply.clone()).is_err());

        run.confirm().unwrap();
        assert_eq!(run.step_status(Step::Apply), Some(StepStatus::Active));
        run.complete_step(apply).unwrap();

        assert_eq!(run.state, WorkflowState::Complete);
        assert_eq!(run.progress, 100);
        assert_eq!(run.results.len(), 3);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_plan_without_changes_skips_apply() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        run.start().unwrap();
        run.complete_step(init_ok()).unwrap();
        run.complete_step(plan(false)).unwrap();

        assert_eq!(run.state, WorkflowState::NoChangesComplete);
        assert!(run.state.is_success());
        assert_eq!(run.step_status(Step::Apply), Some(StepStatus::Pending));
        assert!(run.confirm().is_err());
    }

    #[test]
    fn test_destroy_path() {
        let mut run = WorkflowRun::new(WorkflowKind::Destroy);
        assert_eq!(run.steps.len(), 2);

        run.start().unwrap();
        run.complete_step(init_ok()).unwrap();
        assert_eq!(run.state, WorkflowState::Destroying);

        run.complete_step(result(
            TerraformCommand::Destroy,
            0,
            Summary::Destroy(DestroySummary { destroyed: 4 }),
        ))
        .unwrap();
        assert_eq!(run.state, WorkflowState::DestroyComplete);
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        run.start().unwrap();
        run.complete_step(init_ok()).unwrap();
        run.fail_step("plan failed: Error: invalid provider").unwrap();

        assert_eq!(run.state, WorkflowState::Failed(Step::Plan));
        assert_eq!(run.step_status(Step::Plan), Some(StepStatus::Error));
        assert!(run.error.as_deref().unwrap().contains("invalid provider"));

        let err = run.start().unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: WorkflowState::Failed(Step::Plan),
                ..
            }
        ));
        assert!(run.cancel().is_err());
    }

    #[test]
    fn test_result_for_wrong_step_rejected() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        run.start().unwrap();
        assert!(run.complete_step(plan(true)).is_err());
        assert_eq!(run.state, WorkflowState::Initializing);
    }

    #[test]
    fn test_decline_and_cancel() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        run.start().unwrap();
        run.complete_step(init_ok()).unwrap();
        run.complete_step(plan(true)).unwrap();
        run.decline().unwrap();
        assert_eq!(run.state, WorkflowState::Cancelled);
        assert!(!run.state.is_success());

        let mut run = WorkflowRun::new(WorkflowKind::Destroy);
        run.start().unwrap();
        run.cancel().unwrap();
        assert_eq!(run.state, WorkflowState::Cancelled);
        assert_eq!(run.step_status(Step::Init), Some(StepStatus::Error));
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut run = WorkflowRun::new(WorkflowKind::Deploy);
        let mut last = run.progress;
        run.start().unwrap();
        for next in [init_ok(), plan(true)] {
            assert!(run.progress >= last);
            last = run.progress;
            run.complete_step(next).unwrap();
        }
        assert!(run.progress >= last);
        run.set_progress(10);
        assert_eq!(run.progress, 60);
    }
}
