//! Multipass backend driven through the `multipass` client.

mod cli;

use std::time::Duration;

use tracing::{debug, info};

pub use cli::{InfoEntry, MountEntry, Multipass};

use crate::backend::{
    Backend, BackendError, BackendFuture, BackendKind, ExecutionRequest, FileTransfer,
    InstanceName, InstanceStatus, LaunchRequest, MountSpec, NetworkMode, ReadinessStage,
    ReadyState, RunState, TransferDirection, ignore_missing, probe,
};
use crate::base::Base;
use crate::process::{CommandOutput, CommandRunner, ProcessCommandRunner, current_ids};

/// Settings for [`MultipassBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultipassSettings {
    /// Path or name of the `multipass` client.
    pub program: String,
    /// Deadline for control commands such as `launch` and `delete`.
    pub control_timeout: Duration,
    /// Host resolved by the network readiness probe.
    pub probe_host: String,
    /// Host user and group mapped to root for mounts, when known.
    pub host_ids: Option<(u32, u32)>,
}

impl Default for MultipassSettings {
    fn default() -> Self {
        Self {
            program: "multipass".to_owned(),
            control_timeout: Duration::from_secs(600),
            probe_host: "archive.ubuntu.com".to_owned(),
            host_ids: current_ids(),
        }
    }
}

/// [`Backend`] for Multipass virtual machines.
#[derive(Clone, Debug)]
pub struct MultipassBackend<R = ProcessCommandRunner> {
    client: Multipass<R>,
    probe_host: String,
    host_ids: Option<(u32, u32)>,
}

impl MultipassBackend<ProcessCommandRunner> {
    /// Creates a backend that runs the real `multipass` client.
    #[must_use]
    pub fn new(settings: MultipassSettings) -> Self {
        Self::with_runner(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> MultipassBackend<R> {
    /// Creates a backend that runs `multipass` through `runner`.
    #[must_use]
    pub fn with_runner(settings: MultipassSettings, runner: R) -> Self {
        Self {
            client: Multipass::new(settings.program, settings.control_timeout, runner),
            probe_host: settings.probe_host,
            host_ids: settings.host_ids,
        }
    }

    async fn probe(
        &self,
        name: &InstanceName,
        stage: ReadinessStage,
    ) -> Result<ReadyState, BackendError> {
        match stage {
            ReadinessStage::Boot => {
                let info = self.client.info(name).await?.ok_or_else(|| BackendError::NotFound {
                    name: name.to_string(),
                })?;
                Ok(match RunState::parse(&info.state) {
                    RunState::Running if !info.ipv4.is_empty() => ReadyState::Ready,
                    RunState::Running => ReadyState::not_ready("no IPv4 address assigned"),
                    other => ReadyState::not_ready(format!("state is {other}")),
                })
            }
            ReadinessStage::Network => {
                let output = self
                    .client
                    .exec(name, &probe::network_request(&self.probe_host))
                    .await?;
                Ok(probe::interpret_network(&self.probe_host, &output))
            }
            ReadinessStage::InitSystem => {
                let output = self.client.exec(name, &probe::init_system_request()).await?;
                Ok(probe::interpret_init_system(&output))
            }
        }
    }
}

/// Multipass image alias for a base. Only Ubuntu images are published.
fn image_for(base: &Base) -> Result<String, BackendError> {
    if base.family == "ubuntu" {
        Ok(base.revision.clone())
    } else {
        Err(BackendError::Validation(format!(
            "multipass only provides ubuntu images, not {base}"
        )))
    }
}

impl<R: CommandRunner> Backend for MultipassBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Multipass
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            request.validate()?;
            let name = &request.name;
            let image = image_for(&request.base)?;
            if self.client.info(name).await?.is_some() {
                return Err(BackendError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            let resources = &request.resources;
            let mut options = vec![
                "--cpus".to_owned(),
                resources.cpus.to_string(),
                "--memory".to_owned(),
                format!("{}G", resources.memory_gb),
                "--disk".to_owned(),
                format!("{}G", resources.disk_gb),
            ];
            if let NetworkMode::Attached(network) = &resources.network {
                options.push("--network".to_owned());
                options.push(format!("name={network}"));
            }
            info!(instance = %name, %image, "launching multipass instance");
            self.client.launch(name, &image, &options).await
        })
    }

    fn status<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, Option<InstanceStatus>> {
        Box::pin(async move {
            Ok(self.client.info(name).await?.map(|info| InstanceStatus {
                state: RunState::parse(&info.state),
                addresses: info.ipv4,
            }))
        })
    }

    fn probe_ready<'a>(
        &'a self,
        name: &'a InstanceName,
        stage: ReadinessStage,
    ) -> BackendFuture<'a, ReadyState> {
        Box::pin(self.probe(name, stage))
    }

    fn execute<'a>(
        &'a self,
        name: &'a InstanceName,
        request: &'a ExecutionRequest,
    ) -> BackendFuture<'a, CommandOutput> {
        Box::pin(self.client.exec(name, request))
    }

    fn transfer<'a>(
        &'a self,
        name: &'a InstanceName,
        transfer: &'a FileTransfer,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let host = transfer.host_path.as_str();
            let guest = format!("{name}:{}", transfer.guest_path);
            match transfer.direction {
                TransferDirection::Push => self.client.transfer(name, host, &guest).await,
                TransferDirection::Pull => self.client.transfer(name, &guest, host).await,
            }
        })
    }

    fn mount<'a>(&'a self, name: &'a InstanceName, spec: &'a MountSpec) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let target = spec.guest_target.as_str();
            let info = self.client.info(name).await?.ok_or_else(|| BackendError::NotFound {
                name: name.to_string(),
            })?;
            if info.mounts.contains_key(target) {
                debug!(instance = %name, target, "already mounted");
                return Ok(());
            }
            self.client
                .mount(name, spec.host_source.as_str(), target, self.host_ids)
                .await
        })
    }

    fn start<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(self.client.start(name))
    }

    fn stop<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            match self.client.info(name).await? {
                None => Ok(()),
                Some(info) if RunState::parse(&info.state) == RunState::Stopped => Ok(()),
                Some(_) => ignore_missing(self.client.stop(name).await),
            }
        })
    }

    fn delete<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if self.client.info(name).await?.is_none() {
                return Ok(());
            }
            ignore_missing(self.client.delete(name).await)
        })
    }
}

#[cfg(test)]
mod tests;
