//! Lifecycle of the disposable containers that execute untrusted code.
//!
//! A [`Sandbox`] owns exactly one container for one compile or run stage. It is created
//! stopped, started with its stdin payload, waited on under a wall-clock budget and then
//! inspected to find out why it exited. Destruction is mandatory on every exit path and
//! is idempotent, so callers wrap it in a scope guard.

use crate::cmd::{CommandError, DockerCommand, WaitOutcome};
use log::info;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Directory inside the container where the scratch area is mounted.
pub(crate) const CONTAINER_WORKDIR: &str = "/app";

/// The Docker image used for one execution stage.
pub struct SandboxImage {
    name: String,
}

impl SandboxImage {
    /// Load a local image present in the host machine.
    ///
    /// If the image is not available locally an error will be returned instead.
    pub fn local(name: &str) -> Result<Self, CommandError> {
        let image = SandboxImage { name: name.into() };
        image.ensure_exists_locally()?;
        Ok(image)
    }

    /// Pull an image from its Docker registry.
    ///
    /// This will access the network to download the image. If pulling fails an error
    /// will be returned instead.
    pub fn remote(name: &str) -> Result<Self, CommandError> {
        let image = SandboxImage { name: name.into() };
        info!("pulling image {name} from its registry");
        DockerCommand::new(&["pull", name])
            .run()
            .map_err(|e| CommandError::ImagePullFailed(Box::new(e)))?;
        image.ensure_exists_locally()?;
        Ok(image)
    }

    /// Use the local copy of the image, pulling it from the registry only when missing.
    pub fn ensure(name: &str) -> Result<Self, CommandError> {
        match Self::local(name) {
            Ok(image) => Ok(image),
            Err(_) => Self::remote(name),
        }
    }

    /// Name of the image, as passed to the container runtime.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_exists_locally(&self) -> Result<(), CommandError> {
        info!("checking the image {} is available locally", self.name);
        DockerCommand::new(&["image", "inspect", self.name.as_str()])
            .log_command(false)
            .run()
            .map_err(|e| CommandError::ImageMissing(Box::new(e)))?;
        Ok(())
    }
}

/// Whether to mount the scratch directory in the sandbox with write permissions or not.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MountKind {
    /// Allow the sandboxed code to change the mounted data.
    ReadWrite,
    /// Prevent the sandboxed code from changing the mounted data.
    ReadOnly,
}

/// Resource caps applied to one sandbox.
#[derive(Clone, Debug)]
pub struct Limits {
    /// CPU CFS period, in microseconds.
    pub cpu_period: u64,
    /// Memory cap in the runtime's syntax (e.g. `100m`), reported verbatim when hit.
    pub mem_limit: String,
    /// Cap on the number of processes inside the container.
    pub pids_limit: u32,
    /// Wall-clock budget for the stage.
    pub timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            cpu_period: 1_000_000,
            mem_limit: "100m".to_string(),
            pids_limit: 500,
            timeout: Duration::from_secs(2),
        }
    }
}

/// State block reported by `docker inspect` for a container.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Lifecycle status string (`created`, `running`, `exited`, ...).
    pub status: String,
    /// Whether the main process is still alive.
    pub running: bool,
    /// Whether the kernel OOM killer terminated the container.
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    /// Exit code of the main process.
    pub exit_code: i64,
}

/// How waiting on a sandbox ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The container exited within the wall-clock budget.
    Terminated,
    /// The budget elapsed first; the container is still alive and must be destroyed.
    TimedOut,
}

/// A disposable container executing exactly one compile or run stage.
pub struct Sandbox {
    id: String,
    limits: Limits,
}

impl Sandbox {
    /// Create the container, without starting it.
    ///
    /// `code_dir` is bind-mounted at the container's working directory with `mount`
    /// permissions; the directory is created on the host if it does not exist yet. The
    /// container is held on a stdin pipe so a payload can be attached later.
    pub fn create(
        image: &str,
        command: &str,
        code_dir: &Path,
        mount: MountKind,
        limits: Limits,
    ) -> Result<Self, CommandError> {
        std::fs::create_dir_all(code_dir)?;

        let out = DockerCommand::new(&create_args(image, command, code_dir, mount, &limits))
            .run_capture()?;
        let id = out
            .stdout_string()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(Sandbox { id, limits })
    }

    /// Start the container, feed `stdin` to it and wait for it to exit within the
    /// configured wall-clock budget.
    ///
    /// On [`WaitStatus::TimedOut`] the container is still running; the caller is
    /// expected to destroy it.
    pub fn run(&self, stdin: &[u8]) -> Result<WaitStatus, CommandError> {
        let outcome = DockerCommand::new(&["start", "-a", "-i", self.id.as_str()])
            .stdin(stdin.to_vec())
            .timeout(self.limits.timeout)
            .log_command(false)
            .run_wait()?;
        Ok(match outcome {
            WaitOutcome::Exited { .. } => WaitStatus::Terminated,
            WaitOutcome::TimedOut => WaitStatus::TimedOut,
        })
    }

    /// Read the container's state block.
    pub fn state(&self) -> Result<ContainerState, CommandError> {
        let out = DockerCommand::new(&["inspect", "--format", "{{json .State}}", self.id.as_str()])
            .log_command(false)
            .run_capture()?;
        serde_json::from_str(out.stdout_string().trim()).map_err(CommandError::InvalidInspectOutput)
    }

    /// Collect the stdout and stderr streams of the container.
    pub fn logs(&self) -> Result<(String, String), CommandError> {
        let out = DockerCommand::new(&["logs", self.id.as_str()])
            .log_command(false)
            .run_capture()?;
        Ok((out.stdout_string(), out.stderr_string()))
    }

    /// Forcibly terminate and remove the container.
    ///
    /// Safe to call more than once: removing a container that is already gone is a
    /// success.
    pub fn destroy(&self) -> Result<(), CommandError> {
        match DockerCommand::new(&["rm", "-f", self.id.as_str()])
            .log_command(false)
            .run()
        {
            Err(CommandError::ExecutionFailed { stderr, .. })
                if stderr.contains("No such container") =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Identifier of the underlying container.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.id.fmt(f)
    }
}

fn create_args(
    image: &str,
    command: &str,
    code_dir: &Path,
    mount: MountKind,
    limits: &Limits,
) -> Vec<String> {
    let perm = match mount {
        MountKind::ReadWrite => "rw",
        MountKind::ReadOnly => "ro",
    };
    let mut args: Vec<String> = vec!["create".into(), "-i".into()];
    args.push("-v".into());
    // The Z suffix relabels the mount for SELinux hosts.
    args.push(format!(
        "{}:{}:{},Z",
        code_dir.display(),
        CONTAINER_WORKDIR,
        perm
    ));
    args.push("-w".into());
    args.push(CONTAINER_WORKDIR.into());
    args.push("--cpu-period".into());
    args.push(limits.cpu_period.to_string());
    args.push("-m".into());
    args.push(limits.mem_limit.clone());
    args.push("--pids-limit".into());
    args.push(limits.pids_limit.to_string());
    args.push(image.into());
    args.extend(command.split_whitespace().map(String::from));
    args
}

/// Check whether the Docker daemon is running.
///
/// The daemon is required for sandboxing to work, and this function returns whether it
/// is online and reachable or not. Creating a sandbox when the daemon is offline will
/// error too, but this function allows the caller to error earlier.
pub fn docker_running() -> bool {
    info!("checking if the docker daemon is running");
    DockerCommand::new(&["info"]).log_command(false).run().is_ok()
}
