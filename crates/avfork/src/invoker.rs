use crate::child::Child;
use crate::command::{Command, Stdio};
use crate::settings::SpawnSettings;
use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use avfork_syscall::{ExitInfo, Priority, PrlimitResource, Rlimit, Signal};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error(
    "Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'."
)]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Returned by `execute` when the cancellation token fired.
#[derive(Debug, thiserror::Error)]
#[error("Process was cancelled (exit code {exit_code}).")]
pub struct ProcessCancelledError {
    pub exit_code: i32,
}

/// Event data for a line received from stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessDataReceivedEventArgs {
    pub data: String,
}

/// Spawns a child with avfork, streams its stdout/stderr line by line over
/// channels, and supports graceful cancellation (SIGINT, then SIGTERM, then
/// SIGKILL).
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    sigint_timeout: Duration,
    sigterm_timeout: Duration,
    stack_size: usize,
    rlimits: Vec<(PrlimitResource, Rlimit)>,
    priority: Option<Priority>,
    clear_environment: bool,
    /// Channel for stdout lines. Subscribe via `take_stdout_receiver`.
    stdout_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stdout_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    /// Channel for stderr lines. Subscribe via `take_stderr_receiver`.
    stderr_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stderr_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
}

impl ProcessInvoker {
    /// Create a new `ProcessInvoker` with timeouts from `SpawnSettings::global()`.
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self::with_settings(trace, SpawnSettings::global())
    }

    pub fn with_settings(trace: Arc<dyn TraceWriter>, settings: &SpawnSettings) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            sigint_timeout: settings.sigint_timeout(),
            sigterm_timeout: settings.sigterm_timeout(),
            stack_size: settings.stack_size,
            rlimits: Vec::new(),
            priority: None,
            clear_environment: false,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Child stack size used for every spawn, taken from the settings.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Apply `limit` to `resource` in every process this invoker starts.
    pub fn rlimit(&mut self, resource: PrlimitResource, limit: Rlimit) -> &mut Self {
        self.rlimits.retain(|(r, _)| *r != resource);
        self.rlimits.push((resource, limit));
        self
    }

    /// Start every process with the given nice value.
    pub fn priority(&mut self, priority: Priority) -> &mut Self {
        self.priority = Some(priority);
        self
    }

    /// Start processes with only the variables passed to `execute`.
    pub fn env_clear(&mut self) -> &mut Self {
        self.clear_environment = true;
        self
    }

    /// Take the stdout receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_stdout_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stdout_rx.take()
    }

    /// Take the stderr receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_stderr_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stderr_rx.take()
    }

    /// Execute a process with the given parameters.
    ///
    /// # Arguments
    /// * `working_directory` - The working directory for the process.
    /// * `file_name` - The executable to run.
    /// * `arguments` - Command-line arguments as a single string.
    /// * `environment` - Optional environment variable overrides.
    /// * `require_exit_code_zero` - If true, returns an error on non-zero exit.
    /// * `kill_process_on_cancel` - If true, skip graceful shutdown and SIGKILL immediately.
    /// * `cancellation_token` - Token to cancel/kill the process.
    ///
    /// Returns the process exit code, or -1 if it was killed by a signal.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        working_directory: &str,
        file_name: &str,
        arguments: &str,
        environment: Option<&HashMap<String, String>>,
        require_exit_code_zero: bool,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        anyhow::ensure!(!file_name.is_empty(), "file_name must not be empty");

        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{file_name}'"));
        self.trace.info(&format!("  Arguments: '{arguments}'"));
        self.trace
            .info(&format!("  Working directory: '{working_directory}'"));
        self.trace.info(&format!(
            "  Require exit code zero: '{require_exit_code_zero}'"
        ));
        self.trace.info(&format!(
            "  Force kill process on cancellation: '{kill_process_on_cancel}'"
        ));

        let mut cmd = Command::new(file_name);
        if !arguments.is_empty() {
            cmd.args(shell_split(arguments));
        }

        // A missing directory fails the spawn with the child's chdir errno
        if !working_directory.is_empty() {
            cmd.current_dir(working_directory);
        }

        if self.clear_environment {
            cmd.env_clear();
        }
        if let Some(env) = environment {
            cmd.envs(env);
        }

        for (resource, limit) in &self.rlimits {
            cmd.rlimit(*resource, *limit);
        }
        if let Some(priority) = self.priority {
            cmd.priority(priority);
        }

        cmd.stack_size(self.stack_size);
        cmd.stdin(Stdio::Null);
        cmd.stdout(Stdio::Piped);
        cmd.stderr(Stdio::Piped);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to start process '{file_name}' with arguments '{arguments}'")
        })?;

        let pid = child.id();
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let stdout_task = self.spawn_reader(child.take_stdout_async()?, self.stdout_tx.clone(), "STDOUT");
        let stderr_task = self.spawn_reader(child.take_stderr_async()?, self.stderr_tx.clone(), "STDERR");

        let exit_code;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                let status = status.context("Failed to wait for process")?;
                exit_code = exit_code_of(&status);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.info("Cancellation requested.");
                exit_code = self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await;
            }
        }

        // Wait for stream readers to finish
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let elapsed = start.elapsed();
        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {elapsed:.2?}."
        ));

        if was_cancelled {
            return Err(ProcessCancelledError { exit_code }.into());
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: file_name.to_string(),
                arguments: arguments.to_string(),
            }
            .into());
        }

        Ok(exit_code)
    }

    fn spawn_reader<R>(
        &self,
        reader: Option<R>,
        tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
        stream: &'static str,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let trace = self.trace.clone();
        tokio::spawn(async move {
            if let Some(reader) = reader {
                let mut reader = BufReader::new(reader);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let _ = tx.send(ProcessDataReceivedEventArgs {
                                data: decode_line(&line),
                            });
                        }
                        Err(err) => {
                            trace.warning(&format!("{stream} stream read failed: {err}"));
                            break;
                        }
                    }
                }
            }
            trace.info(&format!("{stream} stream read finished."));
        })
    }

    /// Attempt graceful cancellation: SIGINT, then SIGTERM, then SIGKILL.
    /// If `kill_immediately` is true, skip straight to SIGKILL.
    async fn cancel_and_kill_process(&self, child: &mut Child, kill_immediately: bool) -> i32 {
        if !kill_immediately {
            if self
                .send_signal_and_wait(child, Signal::SIGINT, self.sigint_timeout)
                .await
            {
                self.trace
                    .info("Process cancelled successfully through SIGINT.");
                return wait_exit_code(child).await;
            }

            if self
                .send_signal_and_wait(child, Signal::SIGTERM, self.sigterm_timeout)
                .await
            {
                self.trace
                    .info("Process terminated successfully through SIGTERM.");
                return wait_exit_code(child).await;
            }
        }

        self.trace.info(
            "Kill process since both cancel and terminate signals have been ignored.",
        );
        if let Err(err) = child.kill() {
            self.trace.warning(&format!("Failed to kill process {}: {err}", child.id()));
        }
        wait_exit_code(child).await
    }

    /// Send a signal to the child process and wait up to `timeout` for it to exit.
    /// Returns `true` if the process exited within the timeout.
    async fn send_signal_and_wait(&self, child: &mut Child, sig: Signal, timeout: Duration) -> bool {
        let pid = child.id();
        self.trace.info(&format!("Sending {sig:?} to process {pid}."));

        if let Err(err) = child.signal(sig) {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}: {err}"));
            return false;
        }

        self.trace.info(&format!(
            "Waiting for process exit or {:.1}s after {sig:?} signal.",
            timeout.as_secs_f64()
        ));

        tokio::select! {
            result = child.wait() => {
                result.is_ok()
            }
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }
}

/// Strip the line terminator and replace invalid UTF-8 with U+FFFD.
fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn exit_code_of(status: &ExitInfo) -> i32 {
    status.exit_status().unwrap_or(-1)
}

async fn wait_exit_code(child: &mut Child) -> i32 {
    child.wait().await.map(|s| exit_code_of(&s)).unwrap_or(-1)
}

/// Simple argument splitting. Splits on whitespace but respects double-quoted
/// and single-quoted strings, and backslash escapes outside single quotes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;
    // distinguishes `""` (an empty argument) from no argument at all
    let mut has_token = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if !in_single_quote => {
                escape_next = true;
                has_token = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                has_token = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                has_token = true;
            }
            ' ' | '\t' if !in_single_quote && !in_double_quote => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(ch);
                has_token = true;
            }
        }
    }

    if has_token {
        args.push(current);
    }

    args
}
