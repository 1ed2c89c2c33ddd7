//! One-time preparation of a ready instance for its base.
//!
//! [`BaseConfigurer`] moves through `Unconfigured`, `ValidatingCompatibility`
//! and `InstallingPrerequisites` to `Configured`. Validation failures are
//! fatal at once. Installation steps are retried only when their output
//! points at a transient network problem.

mod steps;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ExecutionRequest, ExecutionResult, render_command};
use crate::base::{Base, COMPATIBILITY_FILE, CompatibilityRecord, OsRelease};
use crate::error::ProviderError;
use crate::executor::Executor;
use crate::retry::RetryPolicy;

pub use steps::{InstallStep, prerequisite_steps};

/// Progress of base configuration for one instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigureState {
    /// Nothing has been checked yet.
    Unconfigured,
    /// Checking the guest operating system and compatibility tag.
    ValidatingCompatibility,
    /// Writing configuration files and installing packages.
    InstallingPrerequisites,
    /// Finished; further calls are no-ops.
    Configured,
    /// A previous attempt failed; the instance must be discarded.
    Failed,
}

/// Output fragments that identify a transient network failure.
const NETWORK_MARKERS: [&str; 7] = [
    "Temporary failure resolving",
    "Could not resolve",
    "Failed to fetch",
    "Connection timed out",
    "Network is unreachable",
    "Cannot download",
    "Curl error",
];

/// Classifies a failed installation command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Worth retrying.
    Transient,
    /// Retrying cannot help.
    Fatal,
}

impl FailureClass {
    /// Classifies the result of a failed step.
    #[must_use]
    pub fn of(result: &ExecutionResult) -> Self {
        if matches!(result.exit_code, 126 | 127) || result.stderr.contains("Permission denied") {
            return Self::Fatal;
        }
        let transient = NETWORK_MARKERS
            .iter()
            .any(|marker| result.stderr.contains(marker) || result.stdout.contains(marker));
        if transient { Self::Transient } else { Self::Fatal }
    }
}

/// Validates and prepares an instance for its base exactly once.
#[derive(Clone, Debug)]
pub struct BaseConfigurer {
    base: Base,
    state: ConfigureState,
    install_policy: RetryPolicy,
    max_attempts: u32,
}

impl BaseConfigurer {
    /// Creates a configurer that retries transient install failures up to
    /// `max_attempts` times, spaced by `install_policy`.
    #[must_use]
    pub fn new(base: Base, install_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            base,
            state: ConfigureState::Unconfigured,
            install_policy,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Current progress.
    #[must_use]
    pub const fn state(&self) -> ConfigureState {
        self.state
    }

    /// Base being configured.
    #[must_use]
    pub const fn base(&self) -> &Base {
        &self.base
    }

    /// Validates the guest and installs prerequisites. Does nothing once the
    /// instance is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::BaseValidation`] when the guest does not
    /// match the base, and [`ProviderError::BaseInstallation`] when a step
    /// fails permanently or exhausts its retries.
    pub async fn configure<B>(&mut self, executor: &Executor<'_, B>) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        match self.state {
            ConfigureState::Configured => {
                debug!(instance = %executor.name(), "base already configured");
                return Ok(());
            }
            ConfigureState::Failed => {
                return Err(ProviderError::BaseInstallation {
                    name: executor.name().to_string(),
                    step: "configure base".to_owned(),
                    attempts: 0,
                    details: "an earlier configuration attempt failed".to_owned(),
                });
            }
            ConfigureState::Unconfigured
            | ConfigureState::ValidatingCompatibility
            | ConfigureState::InstallingPrerequisites => {}
        }

        self.state = ConfigureState::ValidatingCompatibility;
        if let Err(err) = self.validate(executor).await {
            self.state = ConfigureState::Failed;
            return Err(err);
        }
        self.state = ConfigureState::InstallingPrerequisites;
        if let Err(err) = self.install(executor).await {
            self.state = ConfigureState::Failed;
            return Err(err);
        }
        self.state = ConfigureState::Configured;
        info!(instance = %executor.name(), base = %self.base, "base configured");
        Ok(())
    }

    async fn validate<B>(&self, executor: &Executor<'_, B>) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        let invalid = |reason: String| ProviderError::BaseValidation {
            name: executor.name().to_string(),
            reason,
        };
        self.base
            .check_installable()
            .map_err(|err| invalid(err.to_string()))?;

        let os_release = executor
            .run(&ExecutionRequest::new(["cat", "/etc/os-release"]))
            .await?;
        if !os_release.success() {
            return Err(invalid(format!(
                "cannot read /etc/os-release: {}",
                os_release.stderr.trim()
            )));
        }
        self.base
            .check_release(&OsRelease::parse(&os_release.stdout))
            .map_err(|err| invalid(err.to_string()))?;

        let record = executor
            .run(&ExecutionRequest::new(["cat", COMPATIBILITY_FILE]))
            .await?;
        if !record.success() {
            debug!(instance = %executor.name(), "no compatibility record, treating as fresh");
            return Ok(());
        }
        let found = CompatibilityRecord::from_yaml(&record.stdout).map_err(|err| {
            invalid(format!("unreadable {COMPATIBILITY_FILE}: {err}"))
        })?;
        if found.compatibility_tag != self.base.compatibility_tag {
            return Err(invalid(format!(
                "compatibility tag {} does not match expected {}",
                found.compatibility_tag, self.base.compatibility_tag
            )));
        }
        Ok(())
    }

    async fn install<B>(&self, executor: &Executor<'_, B>) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        for step in prerequisite_steps(&self.base) {
            match step {
                InstallStep::WriteFile {
                    path,
                    content,
                    mode,
                } => {
                    executor
                        .create_file(Utf8Path::new(path), content.as_bytes(), mode)
                        .await
                        .map_err(|err| {
                            let step = format!("write {path}");
                            self.install_error(executor, &step, 1, err.to_string())
                        })?;
                }
                InstallStep::Run { label, request } => {
                    self.run_with_retry(executor, &label, &request).await?;
                }
            }
        }
        let record = CompatibilityRecord::for_base(&self.base)
            .to_yaml()
            .map_err(|err| {
                self.install_error(executor, "record compatibility", 1, err.to_string())
            })?;
        executor
            .create_file(Utf8Path::new(COMPATIBILITY_FILE), record.as_bytes(), "0644")
            .await
            .map_err(|err| self.install_error(executor, "record compatibility", 1, err.to_string()))
    }

    async fn run_with_retry<B>(
        &self,
        executor: &Executor<'_, B>,
        label: &str,
        request: &ExecutionRequest,
    ) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        let mut retry = self.install_policy.start();
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let (class, details) = match executor.run(request).await {
                Ok(result) if result.success() => {
                    debug!(instance = %executor.name(), step = label, attempts, "step succeeded");
                    return Ok(());
                }
                Ok(result) => (FailureClass::of(&result), describe(request, &result)),
                Err(ProviderError::ExecutionTimeout { command, timeout, .. }) => (
                    FailureClass::Transient,
                    format!("{command} did not finish within {}s", timeout.as_secs()),
                ),
                Err(err) => return Err(err),
            };
            if class == FailureClass::Fatal
                || attempts >= self.max_attempts
                || !retry.wait().await
            {
                return Err(self.install_error(executor, label, attempts, details));
            }
            warn!(
                instance = %executor.name(),
                step = label,
                attempts,
                "transient failure, retrying"
            );
        }
    }

    fn install_error<B>(
        &self,
        executor: &Executor<'_, B>,
        step: &str,
        attempts: u32,
        details: String,
    ) -> ProviderError
    where
        B: Backend + ?Sized,
    {
        debug!(base = %self.base, step, "installation failed");
        ProviderError::BaseInstallation {
            name: executor.name().to_string(),
            step: step.to_owned(),
            attempts,
            details,
        }
    }
}

fn describe(request: &ExecutionRequest, result: &ExecutionResult) -> String {
    crate::backend::CommandDetails {
        command: render_command(&request.command),
        exit_code: Some(result.exit_code),
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
    }
    .to_string()
}

#[cfg(test)]
mod tests;
