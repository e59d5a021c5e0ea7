//! Mock process runner for testing.
//!
//! Provides a scripted implementation of the ProcessRunner trait for use in
//! tests that should not spawn real processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::CommandConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::runner::{
    output_tail, CancelHandle, ExecutionResult, LogHandler, LogLine, LogStream, ProcessRunner,
};

/// Predefined response for one `run` call.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Fail to spawn with this message instead of running
    pub spawn_error: Option<String>,
    /// Block until the runner is cancelled
    pub hang: bool,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 100,
            spawn_error: None,
            hang: false,
        }
    }

    pub fn exit(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code,
            ..Self::success(stdout)
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::success("")
        }
    }

    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::success("")
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::success("")
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub inherit_env: bool,
}

/// Mock process runner.
///
/// Responses are handed out in order; once exhausted every call succeeds with
/// empty output. Output lines are replayed through the log handler so the
/// streaming path is exercised.
#[derive(Clone)]
pub struct MockRunner {
    available: Arc<RwLock<bool>>,
    responses: Arc<RwLock<Vec<MockResponse>>>,
    response_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    cancel: CancelHandle,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            available: Arc::new(RwLock::new(true)),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            cancel: CancelHandle::new(),
        }
    }

    pub fn set_available(self, available: bool) -> Self {
        *self.available.write() = available;
        self
    }

    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        *self.responses.write() = responses;
        self
    }

    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// First argument (the subcommand) of every call, in order.
    pub fn subcommands(&self) -> Vec<String> {
        self.captured_calls
            .read()
            .iter()
            .filter_map(|c| c.args.first().cloned())
            .collect()
    }

    fn next_response(&self) -> MockResponse {
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        self.responses
            .read()
            .get(index)
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }
}

fn replay(text: &str, stream: LogStream, handler: &Option<LogHandler>) {
    if let Some(handler) = handler {
        for line in text.lines() {
            handler(LogLine::new(stream, line));
        }
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn is_available(&self, _binary: &Path) -> bool {
        *self.available.read()
    }

    async fn run(
        &self,
        config: &CommandConfig,
        handler: Option<LogHandler>,
    ) -> RunnerResult<ExecutionResult> {
        let mut cancel_rx = self.cancel.subscribe();

        self.captured_calls.write().push(CapturedCall {
            binary: config.binary.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
            inherit_env: config.inherit_env,
        });

        let response = self.next_response();

        if self.cancel.cancelled_before_start(config) {
            return Err(RunnerError::Cancelled);
        }

        if let Some(message) = response.spawn_error {
            return Err(RunnerError::SpawnFailed {
                binary: config.binary.to_string_lossy().to_string(),
                message,
            });
        }

        if response.hang {
            let _ = cancel_rx.changed().await;
            return Err(RunnerError::Cancelled);
        }

        replay(&response.stdout, LogStream::Stdout, &handler);
        replay(&response.stderr, LogStream::Stderr, &handler);

        if !config.accepts(response.exit_code) {
            return Err(RunnerError::ExitCode {
                code: response.exit_code,
                tail: output_tail(&response.stdout, &response.stderr, 20),
            });
        }

        let started_at = Utc::now();
        let finished_at = started_at + chrono::Duration::milliseconds(response.duration_ms as i64);

        Ok(ExecutionResult {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            started_at,
            finished_at,
            duration_ms: response.duration_ms,
        })
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runner_basic() {
        let runner = MockRunner::new().add_response(MockResponse::success("done"));
        let config = CommandConfig::new("terraform").arg("init");

        let result = runner.run(&config, None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "done");
        assert_eq!(runner.subcommands(), vec!["init"]);
    }

    #[tokio::test]
    async fn test_mock_runner_exit_code_rejected() {
        let runner = MockRunner::new().add_response(MockResponse::failure(1, "Error: bad"));
        let config = CommandConfig::new("terraform").arg("apply");

        let err = runner.run(&config, None).await.unwrap_err();
        match err {
            RunnerError::ExitCode { code, tail } => {
                assert_eq!(code, 1);
                assert_eq!(tail, "Error: bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mock_runner_replays_lines() {
        let runner = MockRunner::new()
            .add_response(MockResponse::success("one\ntwo").with_stderr("warn"));
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        let handler: LogHandler = Arc::new(move |line: LogLine| {
            sink.write().push((line.stream, line.message));
        });

        runner
            .run(&CommandConfig::new("terraform"), Some(handler))
            .await
            .unwrap();

        let seen = seen.read();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (LogStream::Stderr, "warn".to_string()));
    }

    #[tokio::test]
    async fn test_mock_runner_hang_until_cancelled() {
        let runner = MockRunner::new().add_response(MockResponse::hang());
        let cancel = runner.cancel_handle();

        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&CommandConfig::new("terraform"), None).await })
        };

        while runner.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RunnerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_mock_runner_cancel_before_run_starts() {
        let runner = MockRunner::new().add_response(MockResponse::hang());
        let cancel = runner.cancel_handle();

        // The caller commits, then a cancel lands before the runner subscribes
        let seen = cancel.generation();
        cancel.cancel();

        let config = CommandConfig::new("terraform").arg("init").cancel_since(seen);
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), runner.run(&config, None))
            .await
            .expect("cancelled run returns");
        assert!(matches!(result, Err(RunnerError::Cancelled)));
        assert_eq!(runner.subcommands(), vec!["init"]);
    }
}
