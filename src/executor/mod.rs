//! Command execution and file transfer against a ready instance.
//!
//! An [`Executor`] is bound to one backend and one instance name. It adds
//! the base's command environment to every request, enforces deadlines on
//! the host side and turns adapter failures into [`ProviderError`]
//! categories.

mod archive;
mod snap;
mod transfer;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    Backend, CommandDetails, ExecutionRequest, ExecutionResult, FileTransfer, InstanceName,
    TransferDirection, render_command,
};
use crate::error::ProviderError;
use crate::process::CommandOutput;

pub use snap::SnapSource;

/// Extra time the guest-side `timeout` wrapper allows beyond the host
/// deadline, so the host always observes the timeout first. Transfer cleanup
/// waits this long after a timeout for guest steps to be killed.
const GUEST_KILL_GRACE: Duration = Duration::from_secs(2);

/// Deadline for best-effort cleanup after a failed transfer.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs commands and moves files for one instance.
pub struct Executor<'a, B: Backend + ?Sized> {
    backend: &'a B,
    name: &'a InstanceName,
    env: BTreeMap<String, String>,
    default_timeout: Option<Duration>,
    transfer_timeout: Duration,
}

impl<'a, B: Backend + ?Sized> Executor<'a, B> {
    pub(crate) const fn new(
        backend: &'a B,
        name: &'a InstanceName,
        env: BTreeMap<String, String>,
        default_timeout: Option<Duration>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            name,
            env,
            default_timeout,
            transfer_timeout,
        }
    }

    /// Instance this executor targets.
    #[must_use]
    pub const fn name(&self) -> &InstanceName {
        self.name
    }

    /// Runs a command to completion.
    ///
    /// A non-zero exit status is returned in the result, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ExecutionTimeout`] when the deadline passes,
    /// [`ProviderError::Execution`] when the command cannot be run or
    /// reports no exit status, and [`ProviderError::BackendUnavailable`]
    /// when the service is gone.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ProviderError> {
        let command = render_command(&request.command);
        request
            .validate()
            .map_err(|err| self.execution_error(&command, err.to_string()))?;
        let limit = request.timeout.or(self.default_timeout);
        let guest = self.guest_request(request, limit);

        let started = Instant::now();
        let call = self.backend.execute(self.name, &guest);
        let outcome = match limit {
            Some(limit_value) => tokio::time::timeout(limit_value, call).await.map_err(|_| {
                ProviderError::ExecutionTimeout {
                    name: self.name.to_string(),
                    command: command.clone(),
                    timeout: limit_value,
                }
            })?,
            None => call.await,
        };
        let output = outcome.map_err(|err| {
            ProviderError::from_backend(self.backend.kind().as_str(), err, |message| {
                self.execution_error(&command, message)
            })
        })?;
        let Some(exit_code) = output.code else {
            return Err(
                self.execution_error(&command, "terminated without an exit status".to_owned())
            );
        };
        let duration = started.elapsed();
        debug!(
            instance = %self.name,
            %command,
            exit_code,
            duration_ms = duration.as_millis(),
            "command finished"
        );
        Ok(ExecutionResult {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
        })
    }

    /// Runs a command and requires it to exit successfully.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Execution`] carrying the command details
    /// when the exit status is non-zero, plus every error [`Executor::run`]
    /// returns.
    pub async fn run_checked(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ProviderError> {
        let result = self.run(request).await?;
        if result.success() {
            return Ok(result);
        }
        let details = CommandDetails {
            command: render_command(&request.command),
            exit_code: Some(result.exit_code),
            stdout: result.stdout,
            stderr: result.stderr,
        };
        Err(self.execution_error(&details.command, format!("command failed\n{details}")))
    }

    /// Writes `content` to `guest_path` with the given octal `mode`, owned
    /// by root.
    ///
    /// The file is staged under `/tmp` and moved into place, so readers
    /// never observe a partially written file.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transfer`] when staging or moving the file
    /// fails.
    pub async fn create_file(
        &self,
        guest_path: &Utf8Path,
        content: &[u8],
        mode: &str,
    ) -> Result<(), ProviderError> {
        let staged = archive::stage_bytes(content).map_err(|message| {
            self.transfer_error(TransferDirection::Push, None, guest_path, message)
        })?;
        let guest_tmp = scratch_path("");
        let deadline = self.transfer_deadline();
        let steps = async {
            self.backend
                .transfer(
                    self.name,
                    &FileTransfer {
                        host_path: staged.payload(),
                        guest_path: Utf8PathBuf::from(guest_tmp.clone()),
                        direction: TransferDirection::Push,
                    },
                )
                .await
                .map_err(|err| err.to_string())?;
            let commands = [
                vec!["chown".to_owned(), "root:root".to_owned(), guest_tmp.clone()],
                vec!["chmod".to_owned(), mode.to_owned(), guest_tmp.clone()],
                parent_mkdir(guest_path),
                vec![
                    "mv".to_owned(),
                    "-f".to_owned(),
                    "-T".to_owned(),
                    guest_tmp.clone(),
                    guest_path.to_string(),
                ],
            ];
            self.guest_steps(&commands, deadline).await
        };
        self.finish_transfer(
            TransferDirection::Push,
            Some(staged.payload().as_path()),
            guest_path,
            steps,
            deadline,
            &[guest_tmp.as_str()],
        )
        .await
    }

    fn guest_request(
        &self,
        request: &ExecutionRequest,
        limit: Option<Duration>,
    ) -> ExecutionRequest {
        let mut guest = request.clone().env_defaults(&self.env);
        if let Some(limit_value) = limit {
            guest.command = kill_after(limit_value.saturating_add(GUEST_KILL_GRACE), guest.command);
        }
        guest.timeout = None;
        guest
    }

    /// Runs one guest command killed by the guest once `deadline` passes.
    async fn guest_command(
        &self,
        argv: &[String],
        deadline: Instant,
    ) -> Result<CommandOutput, String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut request = ExecutionRequest::new(argv.iter().cloned()).env_defaults(&self.env);
        request.command = kill_after(remaining, request.command);
        self.backend
            .execute(self.name, &request)
            .await
            .map_err(|err| err.to_string())
    }

    /// Runs guest commands in order, stopping at the first failure.
    async fn guest_steps(&self, steps: &[Vec<String>], deadline: Instant) -> Result<(), String> {
        for argv in steps {
            let output = self.guest_command(argv, deadline).await?;
            if !output.is_success() {
                return Err(CommandDetails::new(argv, &output).to_string());
            }
        }
        Ok(())
    }

    /// Removes guest scratch paths, logging rather than failing.
    async fn cleanup_guest(&self, paths: &[&str]) {
        if paths.is_empty() {
            return;
        }
        let mut argv = vec!["rm".to_owned(), "-rf".to_owned(), "--".to_owned()];
        argv.extend(paths.iter().map(|path| (*path).to_owned()));
        let request = ExecutionRequest::new(argv);
        let cleanup = self.backend.execute(self.name, &request);
        match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await {
            Ok(Ok(output)) if output.is_success() => {}
            Ok(Ok(output)) => {
                debug!(
                    instance = %self.name,
                    stderr = %output.stderr.trim(),
                    "guest cleanup failed"
                );
            }
            Ok(Err(err)) => debug!(instance = %self.name, error = %err, "guest cleanup failed"),
            Err(_) => debug!(instance = %self.name, "guest cleanup timed out"),
        }
    }

    /// Deadline shared by every step of a transfer starting now.
    fn transfer_deadline(&self) -> Instant {
        Instant::now() + self.transfer_timeout
    }

    /// Applies `deadline` to `steps`, cleaning up `scratch` when they fail or
    /// time out.
    ///
    /// After a timeout the cleanup waits out the guest kill grace, so a step
    /// still running in the guest is gone before its scratch is removed.
    async fn finish_transfer<F>(
        &self,
        direction: TransferDirection,
        host_path: Option<&Utf8Path>,
        guest_path: &Utf8Path,
        steps: F,
        deadline: Instant,
        scratch: &[&str],
    ) -> Result<(), ProviderError>
    where
        F: Future<Output = Result<(), String>>,
    {
        let outcome = match tokio::time::timeout_at(deadline, steps).await {
            Ok(result) => result,
            Err(_) => {
                tokio::time::sleep(GUEST_KILL_GRACE).await;
                Err(format!(
                    "did not finish within {}s",
                    self.transfer_timeout.as_secs()
                ))
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(message) => {
                self.cleanup_guest(scratch).await;
                Err(self.transfer_error(direction, host_path, guest_path, message))
            }
        }
    }

    fn execution_error(&self, command: &str, message: String) -> ProviderError {
        ProviderError::Execution {
            name: self.name.to_string(),
            command: command.to_owned(),
            message,
        }
    }

    fn transfer_error(
        &self,
        direction: TransferDirection,
        host_path: Option<&Utf8Path>,
        guest_path: &Utf8Path,
        message: String,
    ) -> ProviderError {
        ProviderError::Transfer {
            name: self.name.to_string(),
            direction,
            host_path: host_path.map(Utf8Path::to_path_buf).unwrap_or_default(),
            guest_path: guest_path.to_path_buf(),
            message,
        }
    }
}

/// Unique guest scratch path under `/tmp`.
fn scratch_path(suffix: &str) -> String {
    format!("/tmp/kiln-{}{suffix}", Uuid::new_v4().simple())
}

/// Prefixes `command` with a guest `timeout` that kills it after `limit`,
/// rounded up to whole seconds.
fn kill_after(limit: Duration, command: Vec<String>) -> Vec<String> {
    let seconds = limit
        .as_secs()
        .saturating_add(u64::from(limit.subsec_nanos() > 0))
        .max(1);
    let mut wrapped = vec![
        "timeout".to_owned(),
        "--signal=KILL".to_owned(),
        format!("{seconds}s"),
    ];
    wrapped.extend(command);
    wrapped
}

fn parent_mkdir(guest_path: &Utf8Path) -> Vec<String> {
    let parent = guest_path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("/"));
    vec!["mkdir".to_owned(), "-p".to_owned(), parent.to_string()]
}
