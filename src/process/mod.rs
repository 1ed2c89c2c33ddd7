//! Host process execution used by the backend clients.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{BackendError, CommandDetails, render_command};

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Fully described host command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to run, resolved through `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes written to standard input before it is closed.
    pub stdin: Option<Vec<u8>>,
    /// Deadline after which the process is killed.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Describes `program` run with `args`.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: None,
        }
    }

    /// Feeds `input` to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, input: Option<Vec<u8>>) -> Self {
        self.stdin = input;
        self
    }

    /// Kills the command when it runs longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders the command line for diagnostics.
    #[must_use]
    pub fn render(&self) -> String {
        render_command(
            std::iter::once(self.program.clone())
                .chain(self.args.iter().map(|arg| arg.to_string_lossy().into_owned())),
        )
    }

    /// Builds failure details for this command.
    #[must_use]
    pub fn details(&self, output: &CommandOutput) -> CommandDetails {
        CommandDetails {
            command: self.render(),
            exit_code: output.code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        }
    }
}

/// Errors raised while running a host command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when the process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Category of the spawn failure.
        kind: io::ErrorKind,
        /// Error message from the operating system.
        message: String,
    },
    /// Raised when the process outlives its deadline and is killed.
    #[error("{program} did not finish within {}s", .timeout.as_secs())]
    TimedOut {
        /// Program that was killed.
        program: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Raised when waiting for the process fails.
    #[error("failed to collect output from {program}: {message}")]
    Wait {
        /// Program being awaited.
        program: String,
        /// Error message from the operating system.
        message: String,
    },
}

impl From<RunnerError> for BackendError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Spawn {
                program,
                kind: io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied,
                message,
            } => Self::Unavailable { program, message },
            RunnerError::Spawn {
                program, message, ..
            }
            | RunnerError::Wait { program, message } => Self::Io {
                path: program,
                message,
            },
            RunnerError::TimedOut { program, timeout } => Self::TimedOut { program, timeout },
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, RunnerError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the described command, capturing stdout and stderr.
    ///
    /// Dropping the returned future kills the process.
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            debug!(command = %spec.render(), "running host command");
            let spawn_error = |err: io::Error| RunnerError::Spawn {
                program: spec.program.clone(),
                kind: err.kind(),
                message: err.to_string(),
            };
            let mut child = Command::new(&spec.program)
                .args(&spec.args)
                .stdin(if spec.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_error)?;

            if let (Some(input), Some(mut pipe)) = (spec.stdin.clone(), child.stdin.take()) {
                let program = spec.program.clone();
                tokio::spawn(async move {
                    if let Err(err) = pipe.write_all(&input).await {
                        warn!(%program, error = %err, "failed to write command input");
                    }
                });
            }

            let wait = child.wait_with_output();
            let output = match spec.timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                    RunnerError::TimedOut {
                        program: spec.program.clone(),
                        timeout: limit,
                    }
                })?,
                None => wait.await,
            }
            .map_err(|err| RunnerError::Wait {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Owner of `/proc/self`, which is the effective uid and gid of this
/// process.
#[must_use]
pub fn current_ids() -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .ok()
        .map(|meta| (meta.uid(), meta.gid()))
}

/// Effective uid of this process.
#[must_use]
pub fn current_uid() -> Option<u32> {
    current_ids().map(|(uid, _)| uid)
}

#[cfg(test)]
mod tests;
