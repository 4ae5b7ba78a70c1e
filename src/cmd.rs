//! Invocation plumbing for the `docker` CLI.
//!
//! Every interaction with the container runtime goes through [`DockerCommand`], which
//! layers wall-clock timeouts, separate stdout/stderr capture and stdin feeding on top of
//! the plain child process.

use log::{error, info};
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as AsyncCommand;
use tokio::runtime::Runtime;
use tokio::time;

static RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("failed to construct the tokio runtime"));

/// Error happened while executing a `docker` command.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The command took more time than the timeout to end, and it was killed. The
    /// timeout's value (in seconds) is the first value.
    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    /// The command exited with a non-zero exit code.
    #[error("command failed: {status}\n\n{stderr}")]
    ExecutionFailed {
        /// the exit status we got from the command
        status: ExitStatus,
        /// the captured stderr output
        stderr: String,
    },

    /// The data received from the `docker inspect` command is not valid.
    #[error("invalid output of `docker inspect`: {0}")]
    InvalidInspectOutput(#[source] serde_json::Error),

    /// Pulling an image from its registry failed.
    #[error("failed to pull the image from the registry: {0}")]
    ImagePullFailed(#[source] Box<CommandError>),

    /// The image is missing from the local system.
    #[error("image missing from the local system: {0}")]
    ImageMissing(#[source] Box<CommandError>),

    /// An I/O error occured while executing the command.
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// What happened to a command that was allowed to exit with any status.
pub(crate) enum WaitOutcome {
    /// The command exited on its own within the budget.
    Exited {
        status: ExitStatus,
        output: Output,
    },
    /// The wall clock expired first and the command was killed.
    TimedOut,
}

/// Captured stdout and stderr of a finished command.
pub(crate) struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Output {
    pub(crate) fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub(crate) fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Builder for one invocation of the `docker` CLI.
///
/// A narrower take on [`std::process::Command`]: the binary is always `docker`, stdout
/// and stderr are captured separately, an optional stdin payload is written without
/// closing the stream early, and an optional timeout kills the client on expiry.
pub(crate) struct DockerCommand {
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    log_command: bool,
}

impl DockerCommand {
    pub(crate) fn new<S: AsRef<OsStr>>(args: &[S]) -> Self {
        DockerCommand {
            args: args.iter().map(|arg| arg.as_ref().to_os_string()).collect(),
            stdin: None,
            timeout: None,
            log_command: true,
        }
    }

    /// Payload written to the child's stdin. The pipe is kept open afterwards: the
    /// process on the other side must not see an EOF decide its lifetime.
    pub(crate) fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    /// Wall-clock budget for the whole invocation.
    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn log_command(mut self, log_command: bool) -> Self {
        self.log_command = log_command;
        self
    }

    /// Run the command and fail if it exits with a non-zero code or times out.
    pub(crate) fn run(self) -> Result<(), CommandError> {
        self.run_capture().map(|_| ())
    }

    /// Run the command and return its captured output, failing on a non-zero exit code
    /// or a timeout.
    pub(crate) fn run_capture(self) -> Result<Output, CommandError> {
        let timeout = self.timeout;
        match self.spawn_and_wait()? {
            WaitOutcome::TimedOut => Err(CommandError::Timeout(
                timeout.unwrap_or_default().as_secs(),
            )),
            WaitOutcome::Exited { status, output } if status.success() => Ok(output),
            WaitOutcome::Exited { status, output } => Err(CommandError::ExecutionFailed {
                status,
                stderr: output.stderr_string(),
            }),
        }
    }

    /// Run the command without judging its exit code, reporting whether the wall clock
    /// expired instead. Used to drive sandboxed programs, whose non-zero exits are a
    /// verdict rather than an error.
    pub(crate) fn run_wait(self) -> Result<WaitOutcome, CommandError> {
        self.spawn_and_wait()
    }

    fn spawn_and_wait(self) -> Result<WaitOutcome, CommandError> {
        if self.log_command {
            let printable = self
                .args
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            info!("running `docker {printable}`");
        }

        RUNTIME.block_on(async move {
            let mut cmd = AsyncCommand::new("docker");
            cmd.args(&self.args)
                .stdin(if self.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn()?;
            let mut stdin_pipe = child.stdin.take();
            let mut stdout_pipe = child.stdout.take().unwrap();
            let mut stderr_pipe = child.stderr.take().unwrap();
            let payload = self.stdin.unwrap_or_default();

            let work = async {
                let feed = async {
                    if let Some(pipe) = stdin_pipe.as_mut() {
                        let written = async {
                            pipe.write_all(&payload).await?;
                            pipe.flush().await
                        };
                        // The client goes away as soon as the container exits; a broken
                        // pipe here is not a failure of the command.
                        match written.await {
                            Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                            other => other?,
                        }
                    }
                    Ok::<_, std::io::Error>(())
                };
                let drain = async {
                    let mut stdout = Vec::new();
                    let mut stderr = Vec::new();
                    tokio::try_join!(
                        stdout_pipe.read_to_end(&mut stdout),
                        stderr_pipe.read_to_end(&mut stderr),
                    )?;
                    Ok::<_, std::io::Error>((stdout, stderr))
                };

                let (_, (stdout, stderr), status) = tokio::try_join!(feed, drain, child.wait())?;
                Ok::<_, std::io::Error>(WaitOutcome::Exited {
                    status,
                    output: Output { stdout, stderr },
                })
            };

            match self.timeout {
                None => Ok(work.await?),
                Some(timeout) => {
                    let result = time::timeout(timeout, work).await;
                    match result {
                        Ok(outcome) => Ok(outcome?),
                        Err(_) => {
                            if let Err(err) = child.start_kill() {
                                error!("failed to kill the docker client after a timeout: {err}");
                            }
                            Ok(WaitOutcome::TimedOut)
                        }
                    }
                }
            }
        })
    }
}
