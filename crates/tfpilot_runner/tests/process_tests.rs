//! Integration tests for the subprocess runner.
//!
//! Real-process tests drive `/bin/sh` and only run on Unix. The mock runner
//! tests run everywhere.

use std::sync::{Arc, Mutex};

use tfpilot_runner::{
    CommandConfig, LogHandler, LogLine, LogStream, MockResponse, MockRunner, ProcessRunner,
    RunnerError,
};

fn collecting_handler() -> (LogHandler, Arc<Mutex<Vec<LogLine>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let handler: LogHandler = Arc::new(move |line: LogLine| {
        sink.lock().unwrap().push(line);
    });
    (handler, lines)
}

#[cfg(unix)]
mod real_process {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use tempfile::tempdir;
    use tfpilot_runner::{RunnerOptions, TokioRunner};

    fn sh(script: &str) -> CommandConfig {
        CommandConfig::new("/bin/sh").args(["-c", script])
    }

    /// Lines from both streams are delivered and tagged.
    #[tokio::test]
    async fn test_streams_are_tagged() {
        let runner = TokioRunner::default();
        let (handler, lines) = collecting_handler();

        let result = runner
            .run(&sh("echo out-1; echo err-1 >&2; echo out-2"), Some(handler))
            .await
            .unwrap();

        assert_eq!(result.stdout, "out-1\nout-2\n");
        assert_eq!(result.stderr, "err-1\n");

        let lines = lines.lock().unwrap();
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == LogStream::Stdout)
            .map(|l| l.message.as_str())
            .collect();
        let stderr: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == LogStream::Stderr)
            .map(|l| l.message.as_str())
            .collect();
        assert_eq!(stdout, vec!["out-1", "out-2"]);
        assert_eq!(stderr, vec!["err-1"]);
    }

    /// An exit code listed as success is not an error.
    #[tokio::test]
    async fn test_distinguished_exit_code_accepted() {
        let runner = TokioRunner::default();
        let config = sh("echo 'Plan: 1 to add, 0 to change, 0 to destroy.'; exit 2")
            .success_codes(vec![0, 2]);

        let result = runner.run(&config, None).await.unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(!result.success());
    }

    /// Any other exit code carries the stderr tail.
    #[tokio::test]
    async fn test_failure_carries_tail() {
        let runner = TokioRunner::new(RunnerOptions::new().tail_lines(2));
        let config = sh("echo noise; echo 'Error: one' >&2; echo 'Error: two' >&2; echo 'Error: three' >&2; exit 1");

        match runner.run(&config, None).await {
            Err(RunnerError::ExitCode { code, tail }) => {
                assert_eq!(code, 1);
                assert_eq!(tail, "Error: two\nError: three");
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.exit_code)),
        }
    }

    #[tokio::test]
    async fn test_failure_tail_falls_back_to_stdout() {
        let runner = TokioRunner::default();

        match runner.run(&sh("echo 'only stdout'; exit 3"), None).await {
            Err(RunnerError::ExitCode { code, tail }) => {
                assert_eq!(code, 3);
                assert_eq!(tail, "only stdout");
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.exit_code)),
        }
    }

    #[tokio::test]
    async fn test_working_directory_and_environment() {
        let dir = tempdir().unwrap();
        let runner = TokioRunner::default();

        let mut env = HashMap::new();
        env.insert("TFPILOT_TEST".to_string(), "visible".to_string());
        let config = sh("pwd; echo \"$TFPILOT_TEST\"; echo \"[$HOME]\"")
            .workdir(dir.path())
            .environment(env);

        let result = runner.run(&config, None).await.unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(lines[0]).canonicalize().unwrap(),
            expected
        );
        assert_eq!(lines[1], "visible");
        assert_eq!(lines[2], "[]");
    }

    /// A file that cannot be executed fails before producing output.
    #[tokio::test]
    async fn test_spawn_failure_for_non_executable() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("terraform");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();

        let runner = TokioRunner::default();
        let (handler, lines) = collecting_handler();
        let err = runner
            .run(&CommandConfig::new(&script), Some(handler))
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::SpawnFailed { .. }));
        assert!(lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = TokioRunner::default();
        let err = runner
            .run(&CommandConfig::new("/nonexistent/terraform"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::BinaryNotFound(_)));
    }

    /// Cancelling kills the child and unblocks the run.
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let runner = Arc::new(TokioRunner::default());
        let cancel = runner.cancel_handle();
        let (handler, lines) = collecting_handler();

        let task = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(&sh("echo started; sleep 30; echo never"), Some(handler))
                    .await
            })
        };

        for _ in 0..100 {
            if !lines.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("run did not unblock")
            .unwrap();
        assert!(matches!(result, Err(RunnerError::Cancelled)));
        assert!(lines
            .lock()
            .unwrap()
            .iter()
            .all(|l| l.message != "never"));
    }

    /// A cancel that lands between the caller committing and the spawn still
    /// stops the run; one from before that point does not.
    #[tokio::test]
    async fn test_cancel_before_spawn_honoured() {
        let runner = TokioRunner::default();
        let cancel = runner.cancel_handle();
        let (handler, lines) = collecting_handler();

        let seen = cancel.generation();
        cancel.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(&sh("echo started; sleep 30").cancel_since(seen), Some(handler)),
        )
        .await
        .expect("run did not unblock");
        assert!(matches!(result, Err(RunnerError::Cancelled)));
        assert!(lines.lock().unwrap().is_empty());

        let stale = cancel.generation();
        let result = runner
            .run(&sh("echo ok").cancel_since(stale), None)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "ok");
    }
}

/// The mock replays scripted output through the handler.
#[tokio::test]
async fn test_mock_runner_sequential_responses() {
    let runner = MockRunner::new().with_responses(vec![
        MockResponse::success("Terraform has been successfully initialized!"),
        MockResponse::exit(2, "Plan: 1 to add, 0 to change, 0 to destroy."),
        MockResponse::failure(1, "Error: apply failed"),
    ]);
    let (handler, lines) = collecting_handler();

    let init = CommandConfig::new("terraform").arg("init");
    let plan = CommandConfig::new("terraform")
        .arg("plan")
        .success_codes(vec![0, 2]);
    let apply = CommandConfig::new("terraform").arg("apply");

    assert!(runner.run(&init, Some(handler.clone())).await.unwrap().success());
    assert_eq!(runner.run(&plan, Some(handler.clone())).await.unwrap().exit_code, 2);
    assert!(matches!(
        runner.run(&apply, Some(handler)).await,
        Err(RunnerError::ExitCode { code: 1, .. })
    ));

    assert_eq!(runner.subcommands(), vec!["init", "plan", "apply"]);
    assert_eq!(lines.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_mock_runner_spawn_failure() {
    let runner = MockRunner::new().add_response(MockResponse::spawn_failure("permission denied"));
    let err = runner
        .run(&CommandConfig::new("terraform"), None)
        .await
        .unwrap_err();

    assert!(err.is_spawn_failure());
}

#[tokio::test]
async fn test_mock_runner_availability() {
    let path = std::path::Path::new("terraform");
    assert!(MockRunner::new().is_available(path).await);
    assert!(!MockRunner::new().set_available(false).is_available(path).await);
}
