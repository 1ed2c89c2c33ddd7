//! Provider configuration loaded via `ortho-config`.
//!
//! Values merge defaults, `kiln.toml` discovered through the usual search
//! path (or `KILN_CONFIG_PATH`), and `KILN_*` environment variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::{BackendKind, NetworkMode, Resources};
use crate::lxd::LxdSettings;
use crate::multipass::MultipassSettings;
use crate::process::{current_ids, current_uid};
use crate::retry::RetryPolicy;

/// Settings shared by every kiln operation.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct ProviderConfig {
    /// Host service to use: `lxd` or `multipass`.
    #[ortho_config(default = "lxd".to_owned())]
    pub backend: String,
    /// Seconds allowed for the backend to create an instance.
    #[ortho_config(default = 600)]
    pub launch_timeout_secs: u64,
    /// Seconds allowed for an instance to pass every readiness stage.
    #[ortho_config(default = 300)]
    pub readiness_timeout_secs: u64,
    /// Default seconds allowed for a guest command. Zero disables the
    /// default; requests may still set their own deadline.
    #[ortho_config(default = 0)]
    pub execution_timeout_secs: u64,
    /// Seconds allowed for a push or pull.
    #[ortho_config(default = 600)]
    pub transfer_timeout_secs: u64,
    /// Seconds allowed for control commands such as `stop` and `delete`.
    #[ortho_config(default = 600)]
    pub control_timeout_secs: u64,
    /// Virtual CPUs for new instances.
    #[ortho_config(default = 2)]
    pub cpus: u32,
    /// Memory in GiB for new instances.
    #[ortho_config(default = 2)]
    pub memory_gb: u32,
    /// Root disk in GiB for new instances.
    #[ortho_config(default = 64)]
    pub disk_gb: u32,
    /// `default`, or the name of a host network to attach.
    #[ortho_config(default = "default".to_owned())]
    pub network_mode: String,
    /// Path to the `lxc` client.
    #[ortho_config(default = "lxc".to_owned())]
    pub lxc_bin: String,
    /// LXD project instances are created in.
    #[ortho_config(default = "default".to_owned())]
    pub lxd_project: String,
    /// LXD remote hosting the instances.
    #[ortho_config(default = "local".to_owned())]
    pub lxd_remote: String,
    /// LXD image remote used for Ubuntu bases.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub lxd_image_remote: String,
    /// Path to the `multipass` client.
    #[ortho_config(default = "multipass".to_owned())]
    pub multipass_bin: String,
    /// Host the network readiness probe resolves.
    #[ortho_config(default = "archive.ubuntu.com".to_owned())]
    pub network_probe_host: String,
    /// First backoff interval in milliseconds.
    #[ortho_config(default = 250)]
    pub retry_min_interval_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[ortho_config(default = 5000)]
    pub retry_max_interval_ms: u64,
    /// Attempts allowed for each prerequisite installation command.
    #[ortho_config(default = 3)]
    pub install_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Lxd.as_str().to_owned(),
            launch_timeout_secs: 600,
            readiness_timeout_secs: 300,
            execution_timeout_secs: 0,
            transfer_timeout_secs: 600,
            control_timeout_secs: 600,
            cpus: 2,
            memory_gb: 2,
            disk_gb: 64,
            network_mode: "default".to_owned(),
            lxc_bin: "lxc".to_owned(),
            lxd_project: "default".to_owned(),
            lxd_remote: "local".to_owned(),
            lxd_image_remote: "ubuntu".to_owned(),
            multipass_bin: "multipass".to_owned(),
            network_probe_host: "archive.ubuntu.com".to_owned(),
            retry_min_interval_ms: 250,
            retry_max_interval_ms: 5000,
            install_attempts: 3,
        }
    }
}

/// Deadlines derived from [`ProviderConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    /// Instance creation.
    pub launch: Duration,
    /// All readiness stages together.
    pub readiness: Duration,
    /// Default per-command deadline, if any.
    pub execution: Option<Duration>,
    /// Each push or pull.
    pub transfer: Duration,
    /// Host control commands.
    pub control: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            launch: Duration::from_secs(600),
            readiness: Duration::from_secs(300),
            execution: None,
            transfer: Duration::from_secs(600),
            control: Duration::from_secs(600),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn error(&self, problem: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{} {problem}: set {} or {} in kiln.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl ProviderConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_text(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.error("must not be empty"));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.error("must be greater than zero"));
        }
        Ok(())
    }

    /// Performs semantic validation on every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field and how to
    /// set it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        self.network()?;
        for (value, metadata) in [
            (
                self.launch_timeout_secs,
                FieldMetadata::new(
                    "launch timeout",
                    "KILN_LAUNCH_TIMEOUT_SECS",
                    "launch_timeout_secs",
                ),
            ),
            (
                self.readiness_timeout_secs,
                FieldMetadata::new(
                    "readiness timeout",
                    "KILN_READINESS_TIMEOUT_SECS",
                    "readiness_timeout_secs",
                ),
            ),
            (
                self.transfer_timeout_secs,
                FieldMetadata::new(
                    "transfer timeout",
                    "KILN_TRANSFER_TIMEOUT_SECS",
                    "transfer_timeout_secs",
                ),
            ),
            (
                self.control_timeout_secs,
                FieldMetadata::new(
                    "control timeout",
                    "KILN_CONTROL_TIMEOUT_SECS",
                    "control_timeout_secs",
                ),
            ),
            (
                u64::from(self.cpus),
                FieldMetadata::new("CPU count", "KILN_CPUS", "cpus"),
            ),
            (
                u64::from(self.memory_gb),
                FieldMetadata::new("memory size", "KILN_MEMORY_GB", "memory_gb"),
            ),
            (
                u64::from(self.disk_gb),
                FieldMetadata::new("disk size", "KILN_DISK_GB", "disk_gb"),
            ),
            (
                self.retry_min_interval_ms,
                FieldMetadata::new(
                    "minimum retry interval",
                    "KILN_RETRY_MIN_INTERVAL_MS",
                    "retry_min_interval_ms",
                ),
            ),
            (
                u64::from(self.install_attempts),
                FieldMetadata::new("install attempts", "KILN_INSTALL_ATTEMPTS", "install_attempts"),
            ),
        ] {
            Self::require_positive(value, &metadata)?;
        }
        if self.retry_max_interval_ms < self.retry_min_interval_ms {
            return Err(FieldMetadata::new(
                "maximum retry interval",
                "KILN_RETRY_MAX_INTERVAL_MS",
                "retry_max_interval_ms",
            )
            .error("must not be below the minimum retry interval"));
        }
        Self::require_text(
            &self.lxc_bin,
            &FieldMetadata::new("lxc client path", "KILN_LXC_BIN", "lxc_bin"),
        )?;
        Self::require_text(
            &self.lxd_project,
            &FieldMetadata::new("LXD project", "KILN_LXD_PROJECT", "lxd_project"),
        )?;
        Self::require_text(
            &self.lxd_remote,
            &FieldMetadata::new("LXD remote", "KILN_LXD_REMOTE", "lxd_remote"),
        )?;
        Self::require_text(
            &self.multipass_bin,
            &FieldMetadata::new("multipass client path", "KILN_MULTIPASS_BIN", "multipass_bin"),
        )?;
        Self::require_text(
            &self.network_probe_host,
            &FieldMetadata::new(
                "network probe host",
                "KILN_NETWORK_PROBE_HOST",
                "network_probe_host",
            ),
        )
    }

    /// Parsed backend selection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown backend.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse().map_err(|_| {
            FieldMetadata::new("backend", "KILN_BACKEND", "backend")
                .error("must be lxd or multipass")
        })
    }

    fn network(&self) -> Result<NetworkMode, ConfigError> {
        self.network_mode.parse().map_err(|_| {
            FieldMetadata::new("network mode", "KILN_NETWORK_MODE", "network_mode")
                .error("must be 'default' or a network name")
        })
    }

    /// Resources requested for new instances.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed network mode.
    pub fn resources(&self) -> Result<Resources, ConfigError> {
        Ok(Resources {
            cpus: self.cpus,
            memory_gb: self.memory_gb,
            disk_gb: self.disk_gb,
            network: self.network()?,
        })
    }

    /// Deadlines for each kind of operation.
    #[must_use]
    pub const fn timeouts(&self) -> Timeouts {
        Timeouts {
            launch: Duration::from_secs(self.launch_timeout_secs),
            readiness: Duration::from_secs(self.readiness_timeout_secs),
            execution: if self.execution_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.execution_timeout_secs))
            },
            transfer: Duration::from_secs(self.transfer_timeout_secs),
            control: Duration::from_secs(self.control_timeout_secs),
        }
    }

    /// Settings for the LXD adapter.
    #[must_use]
    pub fn lxd_settings(&self) -> LxdSettings {
        LxdSettings {
            program: self.lxc_bin.clone(),
            project: self.lxd_project.clone(),
            remote: self.lxd_remote.clone(),
            image_remote: self.lxd_image_remote.clone(),
            control_timeout: Duration::from_secs(self.control_timeout_secs),
            probe_host: self.network_probe_host.clone(),
            host_uid: current_uid(),
        }
    }

    /// Settings for the Multipass adapter.
    #[must_use]
    pub fn multipass_settings(&self) -> MultipassSettings {
        MultipassSettings {
            program: self.multipass_bin.clone(),
            control_timeout: Duration::from_secs(self.control_timeout_secs),
            probe_host: self.network_probe_host.clone(),
            host_ids: current_ids(),
        }
    }

    /// Backoff schedule whose deadline is `timeout`.
    #[must_use]
    pub const fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_min_interval_ms),
            Duration::from_millis(self.retry_max_interval_ms),
            timeout,
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<ConfigError> for crate::error::ProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
