//! Runtime selection between the supported backends.

use crate::backend::{
    Backend, BackendFuture, BackendKind, ExecutionRequest, FileTransfer, InstanceName,
    InstanceStatus, LaunchRequest, MountSpec, ReadinessStage, ReadyState,
};
use crate::config::{ConfigError, ProviderConfig};
use crate::lxd::LxdBackend;
use crate::multipass::MultipassBackend;
use crate::process::CommandOutput;

/// Backend chosen by configuration.
#[derive(Clone, Debug)]
pub enum AnyBackend {
    /// LXD system containers.
    Lxd(LxdBackend),
    /// Multipass virtual machines.
    Multipass(MultipassBackend),
}

impl AnyBackend {
    /// Builds the backend named by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown backend name.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(match config.backend_kind()? {
            BackendKind::Lxd => Self::Lxd(LxdBackend::new(config.lxd_settings())),
            BackendKind::Multipass => {
                Self::Multipass(MultipassBackend::new(config.multipass_settings()))
            }
        })
    }
}

impl Backend for AnyBackend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Lxd(backend) => backend.kind(),
            Self::Multipass(backend) => backend.kind(),
        }
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.launch(request),
            Self::Multipass(backend) => backend.launch(request),
        }
    }

    fn status<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, Option<InstanceStatus>> {
        match self {
            Self::Lxd(backend) => backend.status(name),
            Self::Multipass(backend) => backend.status(name),
        }
    }

    fn probe_ready<'a>(
        &'a self,
        name: &'a InstanceName,
        stage: ReadinessStage,
    ) -> BackendFuture<'a, ReadyState> {
        match self {
            Self::Lxd(backend) => backend.probe_ready(name, stage),
            Self::Multipass(backend) => backend.probe_ready(name, stage),
        }
    }

    fn execute<'a>(
        &'a self,
        name: &'a InstanceName,
        request: &'a ExecutionRequest,
    ) -> BackendFuture<'a, CommandOutput> {
        match self {
            Self::Lxd(backend) => backend.execute(name, request),
            Self::Multipass(backend) => backend.execute(name, request),
        }
    }

    fn transfer<'a>(
        &'a self,
        name: &'a InstanceName,
        transfer: &'a FileTransfer,
    ) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.transfer(name, transfer),
            Self::Multipass(backend) => backend.transfer(name, transfer),
        }
    }

    fn mount<'a>(&'a self, name: &'a InstanceName, spec: &'a MountSpec) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.mount(name, spec),
            Self::Multipass(backend) => backend.mount(name, spec),
        }
    }

    fn start<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.start(name),
            Self::Multipass(backend) => backend.start(name),
        }
    }

    fn stop<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.stop(name),
            Self::Multipass(backend) => backend.stop(name),
        }
    }

    fn delete<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        match self {
            Self::Lxd(backend) => backend.delete(name),
            Self::Multipass(backend) => backend.delete(name),
        }
    }
}
