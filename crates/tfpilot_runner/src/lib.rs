//! # tfpilot_runner
//!
//! Subprocess supervision for tfpilot.
//!
//! This crate spawns external tools, streams their stdout and stderr line by
//! line while they run, and classifies the exit code against the set of codes
//! the caller accepts as success.
//!
//! # Features
//!
//! - **Live streaming**: every complete line is delivered to a [`LogHandler`]
//!   as it is read, from two independent reader tasks
//! - **Exit-code contract**: per-command accepted exit codes
//! - **Cancellation**: a [`CancelHandle`] kills the active process
//! - **Dry-Run Mode**: log commands without executing them
//! - **Mock Runner**: scripted responses for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tfpilot_runner::{CommandConfig, LogHandler, ProcessRunner, RunnerOptions, TokioRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = TokioRunner::new(RunnerOptions::default());
//!
//!     let config = CommandConfig::new("terraform")
//!         .args(["plan", "-input=false", "-detailed-exitcode"])
//!         .workdir("./infra")
//!         .success_codes(vec![0, 2]);
//!
//!     let handler: LogHandler = Arc::new(|line| println!("[{}] {}", line.stream, line.message));
//!     let result = runner.run(&config, Some(handler)).await?;
//!     println!("Exit code: {}", result.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mock;
pub mod process;
pub mod runner;

pub use config::{CommandConfig, RunnerOptions};
pub use error::{RunnerError, RunnerResult};
pub use mock::{CapturedCall, MockResponse, MockRunner};
pub use process::{resolve_binary, TokioRunner};
pub use runner::{
    output_tail, CancelHandle, ExecutionResult, LogHandler, LogLine, LogStream, ProcessRunner,
};
