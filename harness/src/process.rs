//! Running external commands
//!
//! Every command the harness runs, setup or test, goes through a
//! [`ProcessRunner`]. [`SystemRunner`] spawns real processes; the
//! memory checker is layered on top as a decorator (see [`crate::memcheck`]).
//!
//! Children are started in their own process group so that a timeout or a
//! cancellation can take down everything they spawned, not just the direct
//! child.

use crate::memcheck::MemcheckReport;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound for draining pipes once the child is gone
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Cannot split command into arguments (unbalanced quotes?): {command}")]
    InvalidCommand { command: String },

    #[error("Command not found: {program}")]
    CommandNotFound { program: String },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Memory checker '{tool}' is not available")]
    ToolUnavailable { tool: String },

    #[error("Memory checker report unusable: {message}")]
    MemcheckReport { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// One command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Text written to the child's stdin; stdin is null otherwise
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// `argv` is `sh -c <command>`
    pub shell: bool,
    /// Run under the memory checker, if the runner supports it
    pub memory_check: bool,
    /// Names artifacts left behind, such as a memory checker report
    pub label: Option<String>,
}

impl RunRequest {
    /// Build a request from a command line.
    ///
    /// Without `shell` the line is split with POSIX shell-word rules and the
    /// program is executed directly; with `shell` it is handed to `sh -c`.
    pub fn from_command(command: &str, shell: bool, timeout: Duration) -> RunnerResult<Self> {
        let argv = if shell {
            vec!["sh".to_string(), "-c".to_string(), command.to_string()]
        } else {
            shlex::split(command).ok_or_else(|| RunnerError::InvalidCommand {
                command: command.to_string(),
            })?
        };
        if argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        Ok(Self {
            argv,
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout,
            shell,
            memory_check: false,
            label: None,
        })
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_memory_check(mut self, memory_check: bool) -> Self {
        self.memory_check = memory_check;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Command line for logs and error messages.
    pub fn display(&self) -> String {
        shlex::try_join(self.argv.iter().map(String::as_str))
            .unwrap_or_else(|_| self.argv.join(" "))
    }
}

/// What came out of one command
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
    /// Present when the command ran under the memory checker
    pub memcheck: Option<MemcheckReport>,
}

impl ProcessOutput {
    /// Exited on its own with status 0.
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run one command to completion, timeout or cancellation.
    ///
    /// Timeouts and cancellations are reported through [`ProcessOutput`],
    /// not as errors.
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ProcessOutput>;

    /// Whether requests with `memory_check` can be honoured.
    fn memory_check_available(&self) -> RunnerResult<()> {
        Err(RunnerError::ToolUnavailable {
            tool: "memory checker".to_string(),
        })
    }
}

/// Spawns real child processes with tokio
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ProcessOutput> {
        let (program, args) = request.argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut std_cmd = std::process::Command::new(program);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.args(args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        debug!(command = %request.display(), cwd = ?request.cwd, "spawning process");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RunnerError::CommandNotFound {
                    program: program.clone(),
                }
            } else {
                RunnerError::Spawn {
                    command: request.display(),
                    source,
                }
            }
        })?;
        let pid = child.id();

        if let (Some(input), Some(mut pipe)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // A child that exits without reading closes the pipe early.
                let _ = pipe.write_all(input.as_bytes()).await;
            });
        }
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

        let termination = tokio::select! {
            status = child.wait() => Termination::Exited(status?),
            () = tokio::time::sleep(request.timeout) => {
                warn!(
                    command = %request.display(),
                    timeout_secs = request.timeout.as_secs_f64(),
                    "process timed out; killing"
                );
                kill_tree(&mut child, pid).await;
                Termination::TimedOut
            }
            () = cancel.cancelled() => {
                debug!(command = %request.display(), "cancellation requested; killing process");
                kill_tree(&mut child, pid).await;
                Termination::Cancelled
            }
        };

        // Anything the child left running in its group goes too.
        sweep_group(pid);

        let stdout = collect(stdout_task, "stdout").await;
        let stderr = collect(stderr_task, "stderr").await;

        let mut output = ProcessOutput {
            stdout,
            stderr,
            duration: started.elapsed(),
            ..ProcessOutput::default()
        };
        match termination {
            Termination::Exited(status) => output.exit_code = status.code(),
            Termination::TimedOut => output.timed_out = true,
            Termination::Cancelled => output.cancelled = true,
        }

        debug!(
            command = %request.display(),
            pid = ?pid,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            cancelled = output.cancelled,
            duration_ms = output.duration.as_millis() as u64,
            "process finished"
        );
        Ok(output)
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Kill the child's whole process group and reap the child.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    sweep_group(pid);
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "child already gone");
    }
    if let Err(err) = child.wait().await {
        warn!(error = %err, "failed to reap killed process");
    }
}

#[cfg(unix)]
fn sweep_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // ESRCH just means the group is already empty.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn sweep_group(_pid: Option<u32>) {}
