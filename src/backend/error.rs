//! Errors raised by backend adapters.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::process::CommandOutput;

/// Diagnostic record for a host command that did not succeed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandDetails {
    /// Shell-quoted rendering of the command line.
    pub command: String,
    /// Exit status, when the process reported one.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandDetails {
    /// Builds details from an argument vector and the captured output.
    #[must_use]
    pub fn new<I, S>(argv: I, output: &CommandOutput) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            command: render_command(argv),
            exit_code: output.code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        }
    }
}

impl fmt::Display for CommandDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "* Command that failed: {}", self.command)?;
        match self.exit_code {
            Some(code) => write!(f, "\n* Command exit code: {code}")?,
            None => write!(f, "\n* Command terminated by signal")?,
        }
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            write!(f, "\n* Command output: {stdout}")?;
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            write!(f, "\n* Command standard error output: {stderr}")?;
        }
        Ok(())
    }
}

/// Renders an argument vector as a copy-pasteable shell command.
#[must_use]
pub fn render_command<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    argv.into_iter()
        .map(|arg| escape(Cow::Borrowed(arg.as_ref())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Errors raised by backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field or carries an
    /// unsupported value.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when the service client is missing or its daemon cannot be
    /// reached.
    #[error("{program} is unavailable: {message}")]
    Unavailable {
        /// Client program that could not be used.
        program: String,
        /// Reason reported by the host.
        message: String,
    },
    /// Raised when the named instance does not exist.
    #[error("instance {name} does not exist")]
    NotFound {
        /// Instance name.
        name: String,
    },
    /// Raised when launching over a name that is already in use.
    #[error("instance {name} already exists")]
    AlreadyExists {
        /// Instance name.
        name: String,
    },
    /// Raised when a client command exits unsuccessfully.
    #[error("{brief}\n{details}")]
    Command {
        /// One-line summary of the attempted action.
        brief: String,
        /// Full diagnostic record.
        details: CommandDetails,
    },
    /// Raised when a client prints output that cannot be parsed.
    #[error("unexpected output from {program}: {message}")]
    MalformedOutput {
        /// Client program that produced the output.
        program: String,
        /// Parse failure description.
        message: String,
    },
    /// Raised when a client command does not finish within its deadline.
    #[error("{program} did not finish within {}s", .timeout.as_secs())]
    TimedOut {
        /// Client program that was terminated.
        program: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Raised when host-side file handling fails.
    #[error("host I/O failed for {path}: {message}")]
    Io {
        /// Host path involved in the failure.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

impl BackendError {
    /// Returns `true` when retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Command { .. } | Self::TimedOut { .. } | Self::MalformedOutput { .. }
        )
    }
}
