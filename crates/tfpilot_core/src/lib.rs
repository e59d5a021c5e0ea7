//! # tfpilot_core
//!
//! Deployment workflow orchestration for tfpilot.
//!
//! # Architecture
//!
//! - **Workflow**: the `init -> plan -> apply | destroy` state machine and its run log
//! - **Engine**: single task that owns the workspace, credentials and run,
//!   driven by [`EngineCommand`]s and reporting [`EngineEvent`]s
//! - **Config**: layered [`EngineConfig`]
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tfpilot_core::{Engine, EngineCommand, EngineConfig, EngineEvent};
//! use tfpilot_iac::CredentialContext;
//! use tfpilot_runner::TokioRunner;
//!
//! let (engine, mut events) = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(TokioRunner::default()),
//!     CredentialContext::new(),
//! );
//! let handle = engine.spawn();
//!
//! handle.send(EngineCommand::Extract { archive: "infra.tar.gz".into() }).await?;
//! handle.send(EngineCommand::StartDeploy).await?;
//! while let Some(event) = events.recv().await {
//!     if let EngineEvent::AwaitingConfirmation(plan) = event {
//!         println!("{}", plan);
//!         handle.send(EngineCommand::Confirm).await?;
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::{CoreError, CoreResult};
pub use events::{EngineCommand, EngineEvent};
pub use log::{LogEntry, LogFormat, LogLevel};
pub use workflow::{Step, StepRecord, StepStatus, WorkflowKind, WorkflowRun, WorkflowState};
