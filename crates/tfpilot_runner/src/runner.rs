//! Process runner trait and types.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::CommandConfig;
use crate::error::RunnerResult;

/// Result of a finished process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code reported by the process
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Execution start time
    pub started_at: DateTime<Utc>,
    /// Execution end time
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Check if execution exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr).
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// The last `lines` non-empty lines of stderr, or of stdout when stderr is blank.
pub fn output_tail(stdout: &str, stderr: &str, lines: usize) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let kept: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}

/// One line of process output.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogLine {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
        }
    }
}

/// Output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Log level a line from this stream is reported at.
    pub fn level(&self) -> &'static str {
        match self {
            Self::Stdout => "info",
            Self::Stderr => "error",
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Log handler callback type. Called from reader tasks, once per complete line.
pub type LogHandler = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Kill switch for the process a runner is currently supervising.
///
/// Every call to [`CancelHandle::cancel`] bumps a generation counter; a run
/// only reacts to bumps that happen after it started, so a stale cancel does
/// not abort the next run. Callers that commit to a run before the runner
/// gets to subscribe pass the generation they saw through
/// [`CommandConfig::cancel_since`].
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Kill the active process, if any.
    pub fn cancel(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Number of cancels issued so far.
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Whether `cancel` was called after `generation` was observed.
    pub fn is_cancelled_since(&self, generation: u64) -> bool {
        self.generation() > generation
    }

    /// Whether `config` was cancelled before the runner started it.
    pub fn cancelled_before_start(&self, config: &CommandConfig) -> bool {
        config
            .cancel_generation
            .map_or(false, |generation| self.is_cancelled_since(generation))
    }

    /// Subscribe before spawning; `changed()` resolves on the next cancel.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        let mut rx = self.tx.subscribe();
        rx.borrow_and_update();
        rx
    }
}

/// Subprocess runner trait.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Check whether the binary can be resolved.
    async fn is_available(&self, binary: &Path) -> bool;

    /// Run a command to completion, streaming each output line to `handler`.
    ///
    /// Exit codes outside `config.success_codes` are returned as
    /// [`RunnerError::ExitCode`](crate::RunnerError::ExitCode).
    async fn run(
        &self,
        config: &CommandConfig,
        handler: Option<LogHandler>,
    ) -> RunnerResult<ExecutionResult>;

    /// Handle that kills whatever this runner is executing.
    fn cancel_handle(&self) -> CancelHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tail_prefers_stderr() {
        let tail = output_tail("out 1\nout 2\n", "Error: boom\n\n  detail\n", 5);
        assert_eq!(tail, "Error: boom\n  detail");
    }

    #[test]
    fn test_output_tail_falls_back_to_stdout() {
        let tail = output_tail("a\nb\nc\nd\n", "  \n", 2);
        assert_eq!(tail, "c\nd");
    }

    #[test]
    fn test_stream_levels() {
        assert_eq!(LogStream::Stdout.level(), "info");
        assert_eq!(LogStream::Stderr.level(), "error");
    }

    #[tokio::test]
    async fn test_cancel_handle_ignores_earlier_cancels() {
        let handle = CancelHandle::new();
        handle.cancel();

        let mut rx = handle.subscribe();
        assert!(!rx.has_changed().unwrap());

        handle.cancel();
        rx.changed().await.unwrap();
    }

    #[test]
    fn test_cancel_since_generation() {
        let handle = CancelHandle::new();
        handle.cancel();
        let seen = handle.generation();
        assert_eq!(seen, 1);

        let config = CommandConfig::new("terraform").cancel_since(seen);
        assert!(!handle.cancelled_before_start(&config));
        assert!(!handle.cancelled_before_start(&CommandConfig::new("terraform")));

        handle.cancel();
        assert!(handle.is_cancelled_since(seen));
        assert!(handle.cancelled_before_start(&config));
        // Without a generation only cancels after subscribe count
        assert!(!handle.cancelled_before_start(&CommandConfig::new("terraform")));
    }
}
