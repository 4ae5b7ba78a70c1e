//! The compile-then-run execution protocol and its outcome classification.
//!
//! Interpreted languages go through the run stage only; compiled languages get a
//! preliminary compile stage in their compiler image, producing a statically linked
//! `code` artifact that the run stage executes inside the minimal runtime image.

use crate::cmd::CommandError;
use crate::languages::LanguageProfile;
use crate::sandbox::{Limits, MountKind, Sandbox, WaitStatus};
use log::{error, info};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Wall-clock budget for a compile stage.
const COMPILE_TIMEOUT: Duration = Duration::from_secs(5);
/// Wall-clock budget for a run stage.
const RUN_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay between a non-zero exit and the log read, letting the runtime flush its final
/// stderr write.
const LOG_SETTLE: Duration = Duration::from_millis(100);

/// Name of the stdin payload file in the scratch directory.
pub(crate) const INPUT_FILE: &str = "input.txt";
/// Name of the executable produced by a compile stage.
pub(crate) const ARTIFACT_FILE: &str = "code";

/// The stage of the execution protocol an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The compilation of the submitted source.
    Compile,
    /// The execution of the compiled artifact or interpreted source.
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Stage::Compile => "Compile Time",
            Stage::Run => "Run Time",
        })
    }
}

/// Classified result of executing one (source, stdin) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The program exited with code 0.
    Success {
        /// Captured stdout of the run stage.
        stdout: String,
        /// Captured stderr of the run stage.
        stderr: String,
    },
    /// The compiler exited with a non-zero code.
    CompileError {
        /// Stderr of the compiler.
        stderr: String,
    },
    /// The program exited with a non-zero code.
    RuntimeError {
        /// Stderr of the program.
        stderr: String,
    },
    /// The stage did not finish within its wall-clock budget.
    TimeLimit {
        /// Stage whose budget was exhausted.
        stage: Stage,
        /// The exhausted budget.
        limit: Duration,
    },
    /// The kernel OOM killer terminated the stage.
    MemoryLimit {
        /// Stage that ran out of memory.
        stage: Stage,
        /// The violated cap, in the runtime's syntax.
        limit: String,
    },
    /// The worker itself failed; not a verdict about the submitted program.
    Internal {
        /// Description of the failure.
        detail: String,
    },
}

impl Outcome {
    /// Stage the outcome belongs to, when it describes the failure of one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Outcome::CompileError { .. } => Some(Stage::Compile),
            Outcome::RuntimeError { .. } => Some(Stage::Run),
            Outcome::TimeLimit { stage, .. } | Outcome::MemoryLimit { stage, .. } => Some(*stage),
            Outcome::Success { .. } | Outcome::Internal { .. } => None,
        }
    }

    /// Human-readable failure text. The judge consumes this verbatim, so the limit
    /// templates are part of the external contract.
    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::CompileError { stderr } | Outcome::RuntimeError { stderr } => {
                Some(stderr.clone())
            }
            Outcome::TimeLimit { stage, limit } => Some(format!(
                "{stage} Limit Exceeded\n\t{stage} Limit = {}s",
                limit.as_secs()
            )),
            Outcome::MemoryLimit { limit, .. } => {
                Some(format!("Memory Limit Exceeded\n\tMemory Limit: {limit}"))
            }
            Outcome::Internal { detail } => Some(detail.clone()),
        }
    }
}

/// Strategy executing one case; the seam tests use to stand in for the container
/// runtime.
pub trait ExecutionEngine {
    /// Execute `source` against `stdin` according to `profile` and classify the result.
    fn execute(&self, profile: &LanguageProfile, source: &str, stdin: &str) -> Outcome;
}

/// [`ExecutionEngine`] backed by disposable Docker containers.
pub struct DockerEngine {
    code_dir: PathBuf,
}

impl DockerEngine {
    /// Engine keeping its scratch files under `<work_dir>/code`, the directory
    /// bind-mounted into every sandbox.
    pub fn new(work_dir: &Path) -> Self {
        DockerEngine {
            code_dir: work_dir.join("code"),
        }
    }

    fn run_stages(
        &self,
        profile: &LanguageProfile,
        source: &str,
        stdin: &str,
    ) -> Result<Outcome, CommandError> {
        fs::create_dir_all(&self.code_dir)?;
        fs::write(self.code_dir.join(profile.source_name), source)?;
        fs::write(self.code_dir.join(INPUT_FILE), stdin)?;

        if let (Some(image), Some(command)) = (&profile.compile_image, profile.compile_cmd) {
            let limits = Limits {
                timeout: COMPILE_TIMEOUT,
                ..Limits::default()
            };
            // The compile sandbox is destroyed before the run sandbox exists; the two
            // never overlap on the scratch mount.
            let outcome =
                self.exec_stage(Stage::Compile, image, command, MountKind::ReadWrite, &[], limits)?;
            if !matches!(outcome, Outcome::Success { .. }) {
                return Ok(outcome);
            }
        }

        let mut payload = fs::read(self.code_dir.join(INPUT_FILE))?;
        if profile.needs_compile() {
            // Statically linked binaries read stdin line-wise; terminate the last line.
            payload.push(b'\n');
        }
        let mount = if profile.needs_compile() {
            MountKind::ReadWrite
        } else {
            MountKind::ReadOnly
        };
        self.exec_stage(
            Stage::Run,
            &profile.runtime_image,
            profile.run_cmd,
            mount,
            &payload,
            Limits {
                timeout: RUN_TIMEOUT,
                ..Limits::default()
            },
        )
    }

    fn exec_stage(
        &self,
        stage: Stage,
        image: &str,
        command: &str,
        mount: MountKind,
        stdin: &[u8],
        limits: Limits,
    ) -> Result<Outcome, CommandError> {
        info!("executing {stage} stage in {image}");
        let mem_limit = limits.mem_limit.clone();
        let timeout = limits.timeout;
        let sandbox = Sandbox::create(image, command, &self.code_dir, mount, limits)?;

        // Ensure the container is properly removed even if a later step fails
        scopeguard::defer! {
            if let Err(err) = sandbox.destroy() {
                error!("failed to destroy container {}", sandbox);
                error!("caused by: {}", err);
                let mut err: &dyn Error = &err;
                while let Some(cause) = err.source() {
                    error!("caused by: {}", cause);
                    err = cause;
                }
            }
        }

        if let WaitStatus::TimedOut = sandbox.run(stdin)? {
            return Ok(Outcome::TimeLimit {
                stage,
                limit: timeout,
            });
        }

        let state = sandbox.state()?;
        if state.exit_code == 0 {
            let (stdout, stderr) = sandbox.logs()?;
            return Ok(Outcome::Success { stdout, stderr });
        }
        if state.oom_killed {
            return Ok(Outcome::MemoryLimit {
                stage,
                limit: mem_limit,
            });
        }

        // Give the runtime a moment to flush stderr before reading it.
        thread::sleep(LOG_SETTLE);
        let (_, stderr) = sandbox.logs()?;
        Ok(match stage {
            Stage::Compile => Outcome::CompileError { stderr },
            Stage::Run => Outcome::RuntimeError { stderr },
        })
    }
}

impl ExecutionEngine for DockerEngine {
    fn execute(&self, profile: &LanguageProfile, source: &str, stdin: &str) -> Outcome {
        match self.run_stages(profile, source, stdin) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("internal failure while executing a case: {err}");
                Outcome::Internal {
                    detail: err.to_string(),
                }
            }
        }
    }
}
