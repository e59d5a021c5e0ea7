//! Native subprocess runner built on `tokio::process`.
//!
//! stdout and stderr are drained by two independent reader tasks so a full
//! pipe on one side can never stall the other. Each complete line is handed
//! to the [`LogHandler`] as soon as it is read.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{CommandConfig, RunnerOptions};
use crate::error::{RunnerError, RunnerResult};
use crate::runner::{
    output_tail, CancelHandle, ExecutionResult, LogHandler, LogLine, LogStream, ProcessRunner,
};

/// Resolve a binary name or path to an executable file.
///
/// Names without a directory component are looked up on `PATH`.
pub fn resolve_binary(binary: &Path) -> RunnerResult<PathBuf> {
    let not_found = || RunnerError::BinaryNotFound(binary.to_string_lossy().to_string());

    if binary.as_os_str().is_empty() {
        return Err(not_found());
    }

    if binary.is_absolute() || binary.components().count() > 1 {
        return if binary.is_file() {
            Ok(binary.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let path_var = std::env::var_os("PATH").ok_or_else(not_found)?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }

    Err(not_found())
}

/// Subprocess runner that spawns real processes.
pub struct TokioRunner {
    options: RunnerOptions,
    cancel: CancelHandle,
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new(RunnerOptions::default())
    }
}

impl TokioRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            options,
            cancel: CancelHandle::new(),
        }
    }

    /// Check if dry-run mode is enabled.
    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    fn build_command(&self, binary: &Path, config: &CommandConfig) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.workdir {
            cmd.current_dir(dir);
        }
        if !config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&config.env);

        cmd
    }
}

/// Drain one stream line by line, forwarding each line as it arrives.
async fn read_lines<R>(reader: R, stream: LogStream, handler: Option<LogHandler>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut output = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                output.push_str(line);
                output.push('\n');
                if let Some(handler) = &handler {
                    handler(LogLine::new(stream, line));
                }
            }
            Err(e) => {
                warn!("Failed reading {}: {}", stream, e);
                break;
            }
        }
    }

    output
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn is_available(&self, binary: &Path) -> bool {
        resolve_binary(binary).is_ok()
    }

    async fn run(
        &self,
        config: &CommandConfig,
        handler: Option<LogHandler>,
    ) -> RunnerResult<ExecutionResult> {
        let binary = resolve_binary(&config.binary)?;

        if let Some(dir) = &config.workdir {
            if !dir.is_dir() {
                return Err(RunnerError::WorkdirMissing(dir.to_string_lossy().to_string()));
            }
        }

        let cmd_str = config.display();
        info!("Running: {}", cmd_str);

        let mut cancel_rx = self.cancel.subscribe();
        if self.cancel.cancelled_before_start(config) {
            warn!("Cancelled before start: {}", cmd_str);
            return Err(RunnerError::Cancelled);
        }

        if self.options.dry_run {
            info!("[DRY-RUN] Would execute: {}", cmd_str);
            let now = Utc::now();
            return Ok(ExecutionResult {
                exit_code: 0,
                stdout: format!("[DRY-RUN] Command: {}\n", cmd_str),
                stderr: String::new(),
                started_at: now,
                finished_at: now,
                duration_ms: 0,
            });
        }

        let started_at = Utc::now();

        let mut child = self
            .build_command(&binary, config)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed {
                binary: binary.to_string_lossy().to_string(),
                message: e.to_string(),
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill().await;
                return Err(RunnerError::SpawnFailed {
                    binary: binary.to_string_lossy().to_string(),
                    message: "output pipes were not captured".to_string(),
                });
            }
        };

        let stdout_task = tokio::spawn(read_lines(stdout, LogStream::Stdout, handler.clone()));
        let stderr_task = tokio::spawn(read_lines(stderr, LogStream::Stderr, handler));

        debug!("Spawned pid {:?}", child.id());

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel_rx.changed() => {
                warn!("Cancelling: {}", cmd_str);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill process: {}", e);
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunnerError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let exit_code = status.code().unwrap_or(-1);

        if !config.accepts(exit_code) {
            error!("Process failed with exit code {} after {}ms", exit_code, duration_ms);
            return Err(RunnerError::ExitCode {
                code: exit_code,
                tail: output_tail(&stdout, &stderr, self.options.tail_lines),
            });
        }

        info!("Process exited with code {} in {}ms", exit_code, duration_ms);

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            started_at,
            finished_at,
            duration_ms,
        })
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}
