//! Owns one instance from launch to deletion.
//!
//! [`InstanceManager`] drives the backend through launch, readiness and base
//! configuration, then hands out executor operations while the instance is
//! READY. Each executor call moves the instance to EXECUTING and back. The
//! manager is not reentrant: every operation takes `&mut self`, so calls
//! against one instance are serialised by the borrow checker.

use std::time::Duration;

use camino::Utf8Path;
use tracing::{info, warn};

use crate::backend::{
    Backend, BackendKind, ExecutionRequest, ExecutionResult, InstanceName, LaunchRequest,
    MountSpec, Resources, TransferKind, TransferRequest,
};
use crate::base::Base;
use crate::config::{ConfigError, ProviderConfig, Timeouts};
use crate::configure::{BaseConfigurer, ConfigureState};
use crate::error::ProviderError;
use crate::executor::{Executor, SnapSource};
use crate::instance::{Instance, InstanceState};
use crate::readiness::ReadinessWaiter;
use crate::retry::RetryPolicy;

/// Knobs the manager applies to every operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagerSettings {
    /// Per-operation deadlines.
    pub timeouts: Timeouts,
    /// Resources requested at launch.
    pub resources: Resources,
    /// Backoff used while polling readiness. Its timeout is the overall
    /// readiness deadline.
    pub readiness_policy: RetryPolicy,
    /// Backoff between retries of transient installation failures.
    pub install_policy: RetryPolicy,
    /// Attempts allowed for each installation step.
    pub install_attempts: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        let min = Duration::from_millis(250);
        let max = Duration::from_secs(5);
        Self {
            timeouts,
            resources: Resources::default(),
            readiness_policy: RetryPolicy::new(min, max, timeouts.readiness),
            install_policy: RetryPolicy::new(min, max, timeouts.launch),
            install_attempts: 3,
        }
    }
}

impl ManagerSettings {
    /// Derives settings from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration does not validate.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeouts = config.timeouts();
        Ok(Self {
            timeouts,
            resources: config.resources()?,
            readiness_policy: config.retry_policy(timeouts.readiness),
            install_policy: config.retry_policy(timeouts.launch),
            install_attempts: config.install_attempts,
        })
    }
}

/// Lifecycle manager for a single instance.
#[derive(Debug)]
pub struct InstanceManager<B> {
    backend: B,
    settings: ManagerSettings,
    instance: Instance,
    configurer: BaseConfigurer,
}

impl<B: Backend> InstanceManager<B> {
    /// Creates a manager for an instance that does not exist yet.
    #[must_use]
    pub fn new(backend: B, name: InstanceName, base: Base, settings: ManagerSettings) -> Self {
        let configurer = BaseConfigurer::new(
            base.clone(),
            settings.install_policy.clone(),
            settings.install_attempts,
        );
        let instance = Instance::new(name, backend.kind(), base);
        Self {
            backend,
            settings,
            instance,
            configurer,
        }
    }

    /// Record of the managed instance.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.instance.state
    }

    /// Progress of base configuration.
    #[must_use]
    pub const fn configure_state(&self) -> ConfigureState {
        self.configurer.state()
    }

    /// Backend driving the instance.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates the instance, waits for readiness and configures its base.
    ///
    /// A name that already exists in the backend is rejected before any
    /// state change. Any later failure leaves the instance FAILED; only
    /// `stop` and `delete` are accepted afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Launch`], [`ProviderError::ReadinessTimeout`],
    /// [`ProviderError::Probe`], [`ProviderError::BaseValidation`],
    /// [`ProviderError::BaseInstallation`] or
    /// [`ProviderError::BackendUnavailable`] describing the failed phase.
    pub async fn launch(&mut self) -> Result<&Instance, ProviderError> {
        if self.instance.state != InstanceState::NotCreated {
            return Err(self.instance.invalid("launch"));
        }
        let name = self.instance.name.clone();
        let request = LaunchRequest::builder(name.clone(), self.instance.base.clone())
            .resources(self.settings.resources.clone())
            .build()
            .map_err(|err| launch_error(&name, err.to_string()))?;
        let existing = self
            .backend
            .status(&name)
            .await
            .map_err(|err| self.lift(err, |reason| launch_error(&name, reason)))?;
        if existing.is_some() {
            return Err(launch_error(
                &name,
                "an instance with this name already exists".to_owned(),
            ));
        }

        self.instance.transition(InstanceState::Launching, "launch")?;
        info!(
            instance = %name,
            backend = %self.backend.kind(),
            base = %request.base,
            "launching instance"
        );
        let limit = self.settings.timeouts.launch;
        let outcome = match tokio::time::timeout(limit, self.backend.launch(&request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.lift(err, |reason| launch_error(&name, reason))),
            Err(_) => Err(launch_error(
                &name,
                format!("backend did not finish within {}s", limit.as_secs()),
            )),
        };
        if let Err(err) = outcome {
            return Err(self.fail(err));
        }

        self.instance.transition(InstanceState::WaitingReady, "launch")?;
        if let Err(err) = self.await_ready().await {
            return Err(self.fail(err));
        }

        self.instance
            .transition(InstanceState::ConfiguringBase, "launch")?;
        let executor = Executor::new(
            &self.backend,
            &self.instance.name,
            self.instance.base.command_environment(),
            self.settings.timeouts.execution,
            self.settings.timeouts.transfer,
        );
        let configured = self.configurer.configure(&executor).await;
        if let Err(err) = configured {
            return Err(self.fail(err));
        }

        self.instance.transition(InstanceState::Ready, "launch")?;
        info!(instance = %name, "instance ready for use");
        Ok(&self.instance)
    }

    /// Runs a command inside the ready instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, plus every error [`Executor::run`] returns.
    pub async fn execute(
        &mut self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ProviderError> {
        self.begin("execute")?;
        let outcome = self.executor().run(request).await;
        self.instance.transition(InstanceState::Ready, "execute")?;
        outcome
    }

    /// Runs a command and requires a zero exit status.
    ///
    /// # Errors
    ///
    /// As [`InstanceManager::execute`], plus [`ProviderError::Execution`]
    /// for a non-zero exit.
    pub async fn execute_checked(
        &mut self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ProviderError> {
        self.begin("execute")?;
        let outcome = self.executor().run_checked(request).await;
        self.instance.transition(InstanceState::Ready, "execute")?;
        outcome
    }

    /// Copies a host file or directory into the instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::Transfer`] when the copy fails.
    pub async fn push(
        &mut self,
        host_path: &Utf8Path,
        guest_path: &Utf8Path,
    ) -> Result<TransferKind, ProviderError> {
        self.begin("push")?;
        let outcome = self.executor().push(host_path, guest_path).await;
        self.instance.transition(InstanceState::Ready, "push")?;
        outcome
    }

    /// Copies a guest file or directory to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::Transfer`] when the copy fails.
    pub async fn pull(
        &mut self,
        guest_path: &Utf8Path,
        host_path: &Utf8Path,
    ) -> Result<TransferKind, ProviderError> {
        self.begin("pull")?;
        let outcome = self.executor().pull(guest_path, host_path).await;
        self.instance.transition(InstanceState::Ready, "pull")?;
        outcome
    }

    /// Performs a fully described transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::Transfer`] when the copy fails.
    pub async fn transfer(&mut self, request: &TransferRequest) -> Result<(), ProviderError> {
        self.begin("transfer")?;
        let outcome = self.executor().transfer(request).await;
        self.instance.transition(InstanceState::Ready, "transfer")?;
        outcome
    }

    /// Writes a root-owned file with the given octal mode.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::Transfer`] when writing fails.
    pub async fn create_file(
        &mut self,
        guest_path: &Utf8Path,
        content: &[u8],
        mode: &str,
    ) -> Result<(), ProviderError> {
        self.begin("create file")?;
        let outcome = self.executor().create_file(guest_path, content, mode).await;
        self.instance.transition(InstanceState::Ready, "create file")?;
        outcome
    }

    /// Installs a snap into the instance from the store or a host file.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::SnapInstallation`] when any step fails.
    pub async fn install_snap(
        &mut self,
        snap: &str,
        source: &SnapSource,
    ) -> Result<(), ProviderError> {
        self.begin("install snap")?;
        let outcome = self.executor().install_snap(snap, source).await;
        self.instance.transition(InstanceState::Ready, "install snap")?;
        outcome
    }

    /// Shares a host directory into the instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] unless the instance is
    /// READY, and [`ProviderError::Execution`] when the backend refuses the
    /// mount.
    pub async fn mount(&mut self, spec: &MountSpec) -> Result<(), ProviderError> {
        self.begin("mount")?;
        let outcome = self
            .backend
            .mount(&self.instance.name, spec)
            .await
            .map_err(|err| {
                self.lift(err, |message| ProviderError::Execution {
                    name: self.instance.name.to_string(),
                    command: format!("mount {} at {}", spec.host_source, spec.guest_target),
                    message,
                })
            });
        self.instance.transition(InstanceState::Ready, "mount")?;
        outcome
    }

    /// Stops the instance. Stopping an instance that is already stopped,
    /// deleted or never created succeeds without contacting the backend.
    /// After a failed delete the backend stop is issued again.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Teardown`] when the backend fails to stop
    /// the instance; the call may be retried.
    pub async fn stop(&mut self) -> Result<(), ProviderError> {
        self.settle();
        if matches!(
            self.instance.state,
            InstanceState::NotCreated | InstanceState::Stopped | InstanceState::Deleted
        ) {
            return Ok(());
        }
        self.instance.transition(InstanceState::Stopping, "stop")?;
        let name = self.instance.name.clone();
        self.backend
            .stop(&name)
            .await
            .map_err(|err| self.lift(err, |message| teardown_error(&name, "stop", message)))?;
        self.instance.transition(InstanceState::Stopped, "stop")?;
        info!(instance = %name, "instance stopped");
        Ok(())
    }

    /// Deletes the instance from any state, including FAILED. Deleting an
    /// instance twice succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Teardown`] when the backend fails to delete
    /// the instance; the call may be retried.
    pub async fn delete(&mut self) -> Result<(), ProviderError> {
        self.settle();
        match self.instance.state {
            InstanceState::Deleted => return Ok(()),
            InstanceState::NotCreated => {
                self.instance.transition(InstanceState::Deleting, "delete")?;
                return self.instance.transition(InstanceState::Deleted, "delete");
            }
            _ => {}
        }
        self.instance.transition(InstanceState::Deleting, "delete")?;
        let name = self.instance.name.clone();
        self.backend
            .delete(&name)
            .await
            .map_err(|err| self.lift(err, |message| teardown_error(&name, "delete", message)))?;
        self.instance.transition(InstanceState::Deleted, "delete")?;
        info!(instance = %name, "instance deleted");
        Ok(())
    }

    /// Stops a configured instance if needed, boots it again and waits for
    /// readiness. Base configuration is not repeated.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] for an instance that was
    /// never configured, [`ProviderError::Launch`] when the backend cannot
    /// start it, and readiness errors as [`InstanceManager::launch`] does.
    pub async fn restart(&mut self) -> Result<&Instance, ProviderError> {
        if self.configurer.state() != ConfigureState::Configured {
            return Err(self.instance.invalid("restart"));
        }
        if self.instance.state == InstanceState::Ready {
            self.stop().await?;
        }
        if self.instance.state != InstanceState::Stopped {
            return Err(self.instance.invalid("restart"));
        }
        let name = self.instance.name.clone();
        self.backend
            .start(&name)
            .await
            .map_err(|err| self.lift(err, |reason| launch_error(&name, reason)))?;
        self.instance
            .transition(InstanceState::WaitingReady, "restart")?;
        if let Err(err) = self.await_ready().await {
            return Err(self.fail(err));
        }
        self.instance.transition(InstanceState::Ready, "restart")?;
        info!(instance = %name, "instance restarted");
        Ok(&self.instance)
    }

    fn begin(&mut self, operation: &str) -> Result<(), ProviderError> {
        self.settle();
        self.instance.transition(InstanceState::Executing, operation)
    }

    /// Repairs the state left behind when an earlier operation's future was
    /// dropped before it finished.
    fn settle(&mut self) {
        let recovered = match self.instance.state {
            InstanceState::Executing => InstanceState::Ready,
            InstanceState::Launching
            | InstanceState::WaitingReady
            | InstanceState::ConfiguringBase => InstanceState::Failed,
            _ => return,
        };
        warn!(
            instance = %self.instance.name,
            from = %self.instance.state,
            to = %recovered,
            "recovering from an interrupted operation"
        );
        self.instance.state = recovered;
    }

    fn executor(&self) -> Executor<'_, B> {
        Executor::new(
            &self.backend,
            &self.instance.name,
            self.instance.base.command_environment(),
            self.settings.timeouts.execution,
            self.settings.timeouts.transfer,
        )
    }

    async fn await_ready(&self) -> Result<(), ProviderError> {
        ReadinessWaiter::new(self.settings.readiness_policy.clone())
            .wait(&self.backend, &self.instance.name)
            .await
    }

    fn lift(
        &self,
        err: crate::backend::BackendError,
        fallback: impl FnOnce(String) -> ProviderError,
    ) -> ProviderError {
        ProviderError::from_backend(self.backend.kind().as_str(), err, fallback)
    }

    fn fail(&mut self, err: ProviderError) -> ProviderError {
        warn!(
            instance = %self.instance.name,
            state = %self.instance.state,
            error = %err,
            "instance failed"
        );
        if let Err(transition) = self.instance.transition(InstanceState::Failed, "fail") {
            warn!(error = %transition, "cannot mark instance failed");
        }
        err
    }
}

impl<B> InstanceManager<B> {
    /// Service hosting the instance.
    #[must_use]
    pub const fn backend_kind(&self) -> BackendKind {
        self.instance.backend
    }
}

fn launch_error(name: &InstanceName, reason: String) -> ProviderError {
    ProviderError::Launch {
        name: name.to_string(),
        reason,
    }
}

fn teardown_error(name: &InstanceName, operation: &str, message: String) -> ProviderError {
    ProviderError::Teardown {
        name: name.to_string(),
        operation: operation.to_owned(),
        message,
    }
}
