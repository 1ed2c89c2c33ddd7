//! Request and status types exchanged with backends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::{BackendError, InstanceName};
use crate::base::Base;

/// Host virtualisation services kiln can drive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// LXD system containers, driven through the `lxc` client.
    Lxd,
    /// Multipass virtual machines, driven through the `multipass` client.
    Multipass,
}

impl BackendKind {
    /// Returns the lowercase identifier used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lxd => "lxd",
            Self::Multipass => "multipass",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lxd" => Ok(Self::Lxd),
            "multipass" => Ok(Self::Multipass),
            other => Err(BackendError::Validation(format!(
                "unknown backend '{other}', expected 'lxd' or 'multipass'"
            ))),
        }
    }
}

/// Network attachment requested at launch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum NetworkMode {
    /// Whatever the service attaches by default.
    #[default]
    Default,
    /// Attach to the named host network or bridge.
    Attached(String),
}

impl FromStr for NetworkMode {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed {
            "" => Err(BackendError::Validation("network_mode".to_owned())),
            "default" => Ok(Self::Default),
            network => Ok(Self::Attached(network.to_owned())),
        }
    }
}

/// Compute resources requested for a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resources {
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in GiB.
    pub memory_gb: u32,
    /// Root disk size in GiB.
    pub disk_gb: u32,
    /// Network attachment.
    pub network: NetworkMode,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_gb: 2,
            disk_gb: 64,
            network: NetworkMode::Default,
        }
    }
}

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Name the instance will carry.
    pub name: InstanceName,
    /// Base image and its configuration recipe.
    pub base: Base,
    /// Compute resources to allocate.
    pub resources: Resources,
}

impl LaunchRequest {
    /// Starts a builder for a [`LaunchRequest`].
    #[must_use]
    pub fn builder(name: InstanceName, base: Base) -> LaunchRequestBuilder {
        LaunchRequestBuilder {
            name,
            base,
            resources: Resources::default(),
        }
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a resource count is zero or
    /// the base is incomplete.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.resources.cpus == 0 {
            return Err(BackendError::Validation("cpus".to_owned()));
        }
        if self.resources.memory_gb == 0 {
            return Err(BackendError::Validation("memory_gb".to_owned()));
        }
        if self.resources.disk_gb == 0 {
            return Err(BackendError::Validation("disk_gb".to_owned()));
        }
        if self.base.family.is_empty() {
            return Err(BackendError::Validation("base family".to_owned()));
        }
        if self.base.revision.is_empty() {
            return Err(BackendError::Validation("base revision".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`LaunchRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequestBuilder {
    name: InstanceName,
    base: Base,
    resources: Resources,
}

impl LaunchRequestBuilder {
    /// Replaces the requested resources.
    #[must_use]
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Builds and validates the [`LaunchRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the request is incomplete.
    pub fn build(self) -> Result<LaunchRequest, BackendError> {
        let request = LaunchRequest {
            name: self.name,
            base: self.base,
            resources: self.resources,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Coarse run state reported by a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    /// The instance is booted.
    Running,
    /// The instance is booting.
    Starting,
    /// The instance is shut down.
    Stopped,
    /// Any other state string the service reports.
    Other(String),
}

impl RunState {
    /// Interprets a service state string case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" => Self::Stopped,
            _ => Self::Other(value.trim().to_owned()),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Starting => f.write_str("starting"),
            Self::Stopped => f.write_str("stopped"),
            Self::Other(value) => f.write_str(value),
        }
    }
}

/// Snapshot of an instance as the service sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Run state.
    pub state: RunState,
    /// IPv4 addresses assigned to the instance, when the service reports
    /// them.
    pub addresses: Vec<String>,
}

/// Ordered stages an instance passes through before it is usable.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ReadinessStage {
    /// The service reports the instance as running.
    Boot,
    /// The guest can resolve external hosts.
    Network,
    /// The guest init system has finished starting services.
    InitSystem,
}

impl ReadinessStage {
    /// Every stage in the order it must be satisfied.
    pub const ALL: [Self; 3] = [Self::Boot, Self::Network, Self::InitSystem];
}

impl fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boot => "boot",
            Self::Network => "network",
            Self::InitSystem => "init system",
        })
    }
}

/// Result of a single readiness probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadyState {
    /// The stage is satisfied.
    Ready,
    /// The stage is not yet satisfied.
    NotReady {
        /// Last observation, for diagnostics.
        detail: String,
    },
}

impl ReadyState {
    /// Creates a [`ReadyState::NotReady`] with the given detail.
    #[must_use]
    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self::NotReady {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotReady { detail } => write!(f, "not ready ({detail})"),
        }
    }
}

/// Command to run inside an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionRequest {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Working directory inside the guest.
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables set for the command.
    pub env: BTreeMap<String, String>,
    /// Bytes fed to the command's standard input.
    pub stdin: Option<Vec<u8>>,
    /// Deadline for the whole command.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Creates a request for `command` with no extra options.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds every variable from `env`, keeping existing keys.
    #[must_use]
    pub fn env_defaults(mut self, env: &BTreeMap<String, String>) -> Self {
        for (key, value) in env {
            self.env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Sets the bytes written to standard input.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Sets the command deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the command is empty or an
    /// environment key is malformed.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.command.first().is_none_or(String::is_empty) {
            return Err(BackendError::Validation("command".to_owned()));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('='))
        {
            return Err(BackendError::Validation(format!(
                "environment variable name {key:?}"
            )));
        }
        Ok(())
    }

    /// Returns the guest-side argument vector: an `env` prefix carrying the
    /// environment, followed by the command.
    #[must_use]
    pub fn guest_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.command.len() + self.env.len() + 1);
        if !self.env.is_empty() {
            argv.push("env".to_owned());
            argv.extend(self.env.iter().map(|(key, value)| format!("{key}={value}")));
        }
        argv.extend(self.command.iter().cloned());
        argv
    }
}

/// Outcome of a completed command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Guest exit status.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock time the command took.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Direction of a file transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    /// Host to guest.
    Push,
    /// Guest to host.
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Pull => "pull",
        })
    }
}

/// Whether a transfer moves one file or a directory tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// A single regular file.
    File,
    /// A directory and everything below it.
    Directory,
}

/// File or directory copy between host and guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRequest {
    /// Path on the host.
    pub host_path: Utf8PathBuf,
    /// Absolute path inside the guest.
    pub guest_path: Utf8PathBuf,
    /// Copy direction.
    pub direction: TransferDirection,
    /// File or directory tree.
    pub kind: TransferKind,
}

/// Single regular-file copy performed by an adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileTransfer {
    /// Path on the host.
    pub host_path: Utf8PathBuf,
    /// Absolute path inside the guest.
    pub guest_path: Utf8PathBuf,
    /// Copy direction.
    pub direction: TransferDirection,
}

/// Host directory shared into an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountSpec {
    /// Directory on the host.
    pub host_source: Utf8PathBuf,
    /// Absolute mount point inside the guest.
    pub guest_target: Utf8PathBuf,
}
