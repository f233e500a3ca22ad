// ProcessInvoker: spawns child processes for the container driver,
// streams their output line by line and honours cancellation.

use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes. Arguments are left out; they
/// may carry scripts or credentials.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
}

/// Returned when the cancellation token fired while the process was running.
#[derive(Debug, thiserror::Error)]
#[error("Process '{file_name}' was cancelled")]
pub struct ProcessCancelledError {
    pub file_name: String,
}

/// A line received from stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessDataReceivedEventArgs {
    pub data: String,
}

/// Spawns a child process, reads stdout/stderr on separate tasks, supports
/// graceful cancellation (SIGINT → SIGTERM → SIGKILL) and delivers output
/// lines through channels.
///
/// The channels close once both the reader tasks and the invoker itself are
/// dropped, so callers draining a receiver should drop the invoker after
/// `execute` returns.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    stdout_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stdout_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    stderr_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stderr_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Take the stdout receiver. Can only be called once.
    pub fn take_stdout_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stdout_rx.take()
    }

    /// Take the stderr receiver. Can only be called once.
    pub fn take_stderr_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stderr_rx.take()
    }

    /// Execute a process and wait for it to exit.
    ///
    /// # Arguments
    /// * `working_directory` - Working directory; ignored when empty or missing.
    /// * `file_name` - The executable to run.
    /// * `arguments` - Arguments, passed verbatim (no shell splitting).
    /// * `environment` - Optional environment variable overrides.
    /// * `require_exit_code_zero` - If true, returns an error on non-zero exit.
    /// * `kill_process_on_cancel` - If true, skip graceful shutdown and SIGKILL immediately.
    /// * `cancellation_token` - Token to cancel/kill the process.
    ///
    /// Returns the process exit code.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        working_directory: &str,
        file_name: &str,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        require_exit_code_zero: bool,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        if file_name.is_empty() {
            anyhow::bail!("file_name must not be empty");
        }

        self.trace.info(&format!(
            "Starting process: file name '{file_name}', {} argument(s), working directory '{working_directory}'",
            arguments.len()
        ));

        let mut cmd = Command::new(file_name);
        cmd.args(arguments);

        if !working_directory.is_empty() && Path::new(working_directory).is_dir() {
            cmd.current_dir(working_directory);
        }

        if let Some(env) = environment {
            cmd.envs(env);
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start process '{file_name}'"))?;

        let pid = child.id().unwrap_or(0);
        self.trace
            .verbose(&format!("Process started with process id {pid}, waiting for process exit."));

        let stdout_task = {
            let stdout = child.stdout.take();
            let tx = self.stdout_tx.clone();
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx.send(ProcessDataReceivedEventArgs { data: line });
                    }
                }
            })
        };

        let stderr_task = {
            let stderr = child.stderr.take();
            let tx = self.stderr_tx.clone();
            tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx.send(ProcessDataReceivedEventArgs { data: line });
                    }
                }
            })
        };

        let exit_code: i32;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                exit_code = status
                    .context("Failed to wait for process")?
                    .code()
                    .unwrap_or(-1);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.info("Cancellation requested.");
                exit_code = self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await;
            }
        }

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            return Err(ProcessCancelledError {
                file_name: file_name.to_string(),
            }
            .into());
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: file_name.to_string(),
            }
            .into());
        }

        Ok(exit_code)
    }

    /// Attempt graceful cancellation: SIGINT → SIGTERM → SIGKILL.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            for (signal, timeout) in [(Signal::Int, SIGINT_TIMEOUT), (Signal::Term, SIGTERM_TIMEOUT)] {
                if self.send_signal_and_wait(child, signal, timeout).await {
                    self.trace
                        .info(&format!("Process exited after {signal:?}."));
                    return exit_code_of(child).await;
                }
            }
        }

        self.trace
            .info("Killing process since both cancel and terminate signals have been ignored.");
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Send a signal to the child and wait up to `timeout` for it to exit.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CollectingTraceWriter, NullTraceWriter};

    fn make_invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn execute_streams_stdout_lines() {
        let mut invoker = make_invoker();
        let mut rx = invoker.take_stdout_receiver().unwrap();

        let exit_code = invoker
            .execute(
                "",
                "sh",
                &args(&["-c", "echo hello; echo 'two words'"]),
                None,
                false,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        drop(invoker);

        let mut lines = Vec::new();
        while let Some(evt) = rx.recv().await {
            lines.push(evt.data);
        }

        assert_eq!(exit_code, 0);
        assert_eq!(lines, vec!["hello", "two words"]);
    }

    #[tokio::test]
    async fn execute_nonexistent_binary_fails() {
        let invoker = make_invoker();
        let result = invoker
            .execute(
                "",
                "nonexistent_command_xyz_123",
                &[],
                None,
                false,
                false,
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_require_exit_code_zero() {
        let invoker = make_invoker();
        let result = invoker
            .execute("", "false", &[], None, true, false, CancellationToken::new())
            .await;
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ProcessExitCodeError>().is_some());
    }

    #[tokio::test]
    async fn execute_passes_environment() {
        let mut env = HashMap::new();
        env.insert("MY_TEST_VAR".to_string(), "test_value_123".to_string());

        let mut invoker = make_invoker();
        let mut rx = invoker.take_stdout_receiver().unwrap();
        invoker
            .execute(
                "",
                "sh",
                &args(&["-c", "echo $MY_TEST_VAR"]),
                Some(&env),
                true,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        drop(invoker);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data, "test_value_123");
    }

    #[tokio::test]
    async fn traces_start_and_exit() {
        let trace = Arc::new(CollectingTraceWriter::new());
        let invoker = ProcessInvoker::new(trace.clone());
        invoker
            .execute("", "sh", &args(&["-c", "exit 3"]), None, false, false, CancellationToken::new())
            .await
            .unwrap();

        let messages: Vec<String> = trace.messages().into_iter().map(|(_, m)| m).collect();
        assert!(messages[0].starts_with("Starting process: file name 'sh'"));
        assert!(messages.iter().any(|m| m.contains("with exit code 3")));
    }

    #[tokio::test]
    async fn argument_values_stay_out_of_traces_and_errors() {
        let trace = Arc::new(CollectingTraceWriter::new());
        let invoker = ProcessInvoker::new(trace.clone());
        let err = invoker
            .execute("", "sh", &args(&["-c", "exit 2", "hunter2"]), None, true, false, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.to_string().contains("hunter2"));
        let messages: Vec<String> = trace.messages().into_iter().map(|(_, m)| m).collect();
        assert!(messages[0].contains("3 argument(s)"));
        assert!(!messages.iter().any(|m| m.contains("hunter2")));
    }

    #[tokio::test]
    async fn cancellation_returns_cancelled_error() {
        let invoker = make_invoker();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = invoker
            .execute("", "sleep", &args(&["30"]), None, false, true, cancel)
            .await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ProcessCancelledError>().is_some());
    }
}
