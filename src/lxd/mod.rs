//! LXD backend driven through the `lxc` client.

mod lxc;

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

pub use lxc::{DeviceEntry, ListEntry, Lxc};

use crate::backend::{
    Backend, BackendError, BackendFuture, BackendKind, ExecutionRequest, FileTransfer,
    InstanceName, InstanceStatus, LaunchRequest, MountSpec, NetworkMode, ReadinessStage,
    ReadyState, RunState, TransferDirection, ignore_missing, probe,
};
use crate::base::Base;
use crate::process::{CommandOutput, CommandRunner, ProcessCommandRunner, current_uid};

/// Settings for [`LxdBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LxdSettings {
    /// Path or name of the `lxc` client.
    pub program: String,
    /// LXD project instances are created in.
    pub project: String,
    /// Remote that hosts the instances.
    pub remote: String,
    /// Image remote for Ubuntu bases. Other families use `images`.
    pub image_remote: String,
    /// Deadline for control commands such as `launch` and `delete`.
    pub control_timeout: Duration,
    /// Host resolved by the network readiness probe.
    pub probe_host: String,
    /// Host user mapped to root inside the container, when known.
    pub host_uid: Option<u32>,
}

impl Default for LxdSettings {
    fn default() -> Self {
        Self {
            program: "lxc".to_owned(),
            project: "default".to_owned(),
            remote: "local".to_owned(),
            image_remote: "ubuntu".to_owned(),
            control_timeout: Duration::from_secs(600),
            probe_host: "archive.ubuntu.com".to_owned(),
            host_uid: current_uid(),
        }
    }
}

/// [`Backend`] for LXD system containers.
#[derive(Clone, Debug)]
pub struct LxdBackend<R = ProcessCommandRunner> {
    lxc: Lxc<R>,
    image_remote: String,
    probe_host: String,
    host_uid: Option<u32>,
}

impl LxdBackend<ProcessCommandRunner> {
    /// Creates a backend that runs the real `lxc` client.
    #[must_use]
    pub fn new(settings: LxdSettings) -> Self {
        Self::with_runner(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> LxdBackend<R> {
    /// Creates a backend that runs `lxc` through `runner`.
    #[must_use]
    pub fn with_runner(settings: LxdSettings, runner: R) -> Self {
        Self {
            lxc: Lxc::new(
                settings.program,
                settings.project,
                settings.remote,
                settings.control_timeout,
                runner,
            ),
            image_remote: settings.image_remote,
            probe_host: settings.probe_host,
            host_uid: settings.host_uid,
        }
    }

    fn image_for(&self, base: &Base) -> (String, String) {
        if base.family == "ubuntu" {
            (self.image_remote.clone(), base.revision.clone())
        } else {
            (
                "images".to_owned(),
                format!("{}/{}", base.family, base.revision),
            )
        }
    }

    async fn find(&self, name: &InstanceName) -> Result<Option<ListEntry>, BackendError> {
        Ok(self
            .lxc
            .list(name)
            .await?
            .into_iter()
            .find(|entry| entry.name == name.as_str()))
    }

    async fn launch_config(
        &self,
        request: &LaunchRequest,
    ) -> Result<BTreeMap<String, String>, BackendError> {
        let mut config = BTreeMap::from([
            ("limits.cpu".to_owned(), request.resources.cpus.to_string()),
            (
                "limits.memory".to_owned(),
                format!("{}GiB", request.resources.memory_gb),
            ),
        ]);
        if let Some(uid) = self.host_uid {
            config.insert("raw.idmap".to_owned(), format!("both {uid} 0"));
        }
        if self.lxc.supports_mknod().await? {
            config.insert(
                "security.syscalls.intercept.mknod".to_owned(),
                "true".to_owned(),
            );
        }
        Ok(config)
    }

    async fn probe(
        &self,
        name: &InstanceName,
        stage: ReadinessStage,
    ) -> Result<ReadyState, BackendError> {
        match stage {
            ReadinessStage::Boot => {
                let entry = self.find(name).await?.ok_or_else(|| BackendError::NotFound {
                    name: name.to_string(),
                })?;
                Ok(match RunState::parse(&entry.status) {
                    RunState::Running => ReadyState::Ready,
                    other => ReadyState::not_ready(format!("status is {other}")),
                })
            }
            ReadinessStage::Network => {
                let output = self
                    .lxc
                    .exec(name, &probe::network_request(&self.probe_host))
                    .await?;
                Ok(probe::interpret_network(&self.probe_host, &output))
            }
            ReadinessStage::InitSystem => {
                let output = self.lxc.exec(name, &probe::init_system_request()).await?;
                Ok(probe::interpret_init_system(&output))
            }
        }
    }
}

fn device_name(target: &str) -> String {
    let cleaned: String = target
        .trim_matches('/')
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    format!("disk-{cleaned}")
}

impl<R: CommandRunner> Backend for LxdBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxd
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            request.validate()?;
            let name = &request.name;
            if self.find(name).await?.is_some() {
                return Err(BackendError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            let config = self.launch_config(request).await?;
            let mut extra = vec![
                "--device".to_owned(),
                format!("root,size={}GiB", request.resources.disk_gb),
            ];
            if let NetworkMode::Attached(network) = &request.resources.network {
                extra.push("--network".to_owned());
                extra.push(network.clone());
            }
            let (image_remote, image) = self.image_for(&request.base);
            info!(
                instance = %name,
                image = %format!("{image_remote}:{image}"),
                "launching lxd instance"
            );
            self.lxc
                .launch(&image_remote, &image, name, &config, &extra)
                .await
        })
    }

    fn status<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, Option<InstanceStatus>> {
        Box::pin(async move {
            Ok(self.find(name).await?.map(|entry| InstanceStatus {
                state: RunState::parse(&entry.status),
                addresses: Vec::new(),
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
        Box::pin(self.lxc.exec(name, request))
    }

    fn transfer<'a>(
        &'a self,
        name: &'a InstanceName,
        transfer: &'a FileTransfer,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let host = transfer.host_path.as_str();
            let guest = transfer.guest_path.as_str();
            match transfer.direction {
                TransferDirection::Push => self.lxc.file_push(name, host, guest).await,
                TransferDirection::Pull => self.lxc.file_pull(name, guest, host).await,
            }
        })
    }

    fn mount<'a>(&'a self, name: &'a InstanceName, spec: &'a MountSpec) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let target = spec.guest_target.as_str();
            let devices = self.lxc.devices(name).await?;
            if devices
                .values()
                .any(|device| device.kind == "disk" && device.path.as_deref() == Some(target))
            {
                debug!(instance = %name, target, "already mounted");
                return Ok(());
            }
            self.lxc
                .add_disk(name, &device_name(target), spec.host_source.as_str(), target)
                .await
        })
    }

    fn start<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(self.lxc.start(name))
    }

    fn stop<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            match self.find(name).await? {
                None => Ok(()),
                Some(entry) if RunState::parse(&entry.status) == RunState::Stopped => Ok(()),
                Some(_) => ignore_missing(self.lxc.stop(name).await),
            }
        })
    }

    fn delete<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if self.find(name).await?.is_none() {
                return Ok(());
            }
            ignore_missing(self.lxc.delete(name).await)
        })
    }
}
