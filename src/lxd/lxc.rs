//! Thin wrapper over the `lxc` command-line client.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::backend::{BackendError, ExecutionRequest};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Entry of `lxc list --format=yaml`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ListEntry {
    /// Instance name.
    pub name: String,
    /// Run state such as `Running` or `Stopped`.
    pub status: String,
}

/// Disk device entry of `lxc config device show`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct DeviceEntry {
    /// Device type, `disk` for mounts.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Host source path.
    #[serde(default)]
    pub source: Option<String>,
    /// Guest mount point.
    #[serde(default)]
    pub path: Option<String>,
}

/// Runs `lxc` commands scoped to one project and remote.
#[derive(Clone, Debug)]
pub struct Lxc<R> {
    program: String,
    project: String,
    remote: String,
    control_timeout: Duration,
    runner: R,
}

impl<R: CommandRunner> Lxc<R> {
    /// Creates a client.
    #[must_use]
    pub const fn new(
        program: String,
        project: String,
        remote: String,
        control_timeout: Duration,
        runner: R,
    ) -> Self {
        Self {
            program,
            project,
            remote,
            control_timeout,
            runner,
        }
    }

    /// `<remote>:<name>` reference for an instance.
    #[must_use]
    pub fn target(&self, name: &str) -> String {
        format!("{}:{name}", self.remote)
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut all: Vec<OsString> = vec!["--project".into(), self.project.clone().into()];
        all.extend(args.into_iter().map(Into::into));
        CommandSpec {
            program: self.program.clone(),
            args: all,
            stdin: None,
            timeout: Some(self.control_timeout),
        }
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, BackendError> {
        Ok(self.runner.run(spec).await?)
    }

    async fn run_checked(
        &self,
        name: &str,
        brief: &str,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, BackendError> {
        let output = self.run(spec).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(match client_failure(&output.stderr) {
            Some(kind) => kind.into_error(&self.program, name, spec, &output),
            None => BackendError::Command {
                brief: brief.to_owned(),
                details: spec.details(&output),
            },
        })
    }

    /// Launches `image_remote:image` as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc launch` fails.
    pub async fn launch(
        &self,
        image_remote: &str,
        image: &str,
        name: &str,
        config: &BTreeMap<String, String>,
        extra: &[String],
    ) -> Result<(), BackendError> {
        let mut args = vec![
            "launch".to_owned(),
            format!("{image_remote}:{image}"),
            self.target(name),
        ];
        for (key, value) in config {
            args.push("--config".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.extend(extra.iter().cloned());
        let spec = self.spec(args);
        self.run_checked(name, &format!("Failed to launch {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Lists instances whose names start with `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MalformedOutput`] when the YAML cannot be
    /// parsed.
    pub async fn list(&self, name: &str) -> Result<Vec<ListEntry>, BackendError> {
        let spec = self.spec(["list", "--format=yaml", &self.target(name)]);
        let output = self.run_checked(name, "Failed to list instances", &spec).await?;
        serde_yaml::from_str::<Option<Vec<ListEntry>>>(&output.stdout)
            .map(Option::unwrap_or_default)
            .map_err(|err| BackendError::MalformedOutput {
                program: self.program.clone(),
                message: err.to_string(),
            })
    }

    /// Runs a command in the instance without applying a deadline; the
    /// caller owns the timeout.
    ///
    /// The guest's exit status and streams are returned untouched. A
    /// non-zero exit is attributed to the client only when a follow-up
    /// `lxc list` fails or no longer shows the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the `lxc` client itself fails.
    pub async fn exec(
        &self,
        name: &str,
        request: &ExecutionRequest,
    ) -> Result<CommandOutput, BackendError> {
        let mut args = vec!["exec".to_owned(), self.target(name)];
        if let Some(cwd) = &request.cwd {
            args.push("--cwd".to_owned());
            args.push(cwd.to_string());
        }
        args.push("--".to_owned());
        args.extend(request.guest_argv());
        let spec = self
            .spec(args)
            .with_stdin(request.stdin.clone())
            .with_timeout(None);
        let output = self.run(&spec).await?;
        if output.is_success() {
            return Ok(output);
        }
        let present = self.list(name).await?.iter().any(|entry| entry.name == name);
        if present {
            Ok(output)
        } else {
            Err(BackendError::NotFound {
                name: name.to_owned(),
            })
        }
    }

    /// Copies a host file into the instance, owned by root.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc file push` fails.
    pub async fn file_push(
        &self,
        name: &str,
        source: &str,
        destination: &str,
    ) -> Result<(), BackendError> {
        let spec = self.spec([
            "file".to_owned(),
            "push".to_owned(),
            source.to_owned(),
            format!("{}{destination}", self.target(name)),
            "--uid=0".to_owned(),
            "--gid=0".to_owned(),
        ]);
        self.run_checked(name, &format!("Failed to push {source} to {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Copies a file out of the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc file pull` fails.
    pub async fn file_pull(
        &self,
        name: &str,
        source: &str,
        destination: &str,
    ) -> Result<(), BackendError> {
        let spec = self.spec([
            "file".to_owned(),
            "pull".to_owned(),
            format!("{}{source}", self.target(name)),
            destination.to_owned(),
        ]);
        self.run_checked(name, &format!("Failed to pull {source} from {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Reads the devices attached to the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MalformedOutput`] when the YAML cannot be
    /// parsed.
    pub async fn devices(&self, name: &str) -> Result<BTreeMap<String, DeviceEntry>, BackendError> {
        let spec = self.spec(["config", "device", "show", &self.target(name)]);
        let output = self
            .run_checked(name, &format!("Failed to show devices of {name}"), &spec)
            .await?;
        serde_yaml::from_str::<Option<BTreeMap<String, DeviceEntry>>>(&output.stdout)
            .map(Option::unwrap_or_default)
            .map_err(|err| BackendError::MalformedOutput {
                program: self.program.clone(),
                message: err.to_string(),
            })
    }

    /// Attaches a host directory as a disk device.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc config device add` fails.
    pub async fn add_disk(
        &self,
        name: &str,
        device: &str,
        source: &str,
        path: &str,
    ) -> Result<(), BackendError> {
        let spec = self.spec([
            "config".to_owned(),
            "device".to_owned(),
            "add".to_owned(),
            self.target(name),
            device.to_owned(),
            "disk".to_owned(),
            format!("source={source}"),
            format!("path={path}"),
        ]);
        self.run_checked(name, &format!("Failed to mount {source} in {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Starts the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc start` fails.
    pub async fn start(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["start", &self.target(name)]);
        self.run_checked(name, &format!("Failed to start {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Force-stops the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc stop` fails.
    pub async fn stop(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["stop", &self.target(name), "--force"]);
        self.run_checked(name, &format!("Failed to stop {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Force-deletes the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc delete` fails.
    pub async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["delete", &self.target(name), "--force"]);
        self.run_checked(name, &format!("Failed to delete {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Reports whether the server can intercept `mknod` for unprivileged
    /// containers.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `lxc info` fails.
    pub async fn supports_mknod(&self) -> Result<bool, BackendError> {
        let spec = self.spec(["info", &format!("{}:", self.remote)]);
        let output = self.run_checked("", "Failed to query server info", &spec).await?;
        let info: serde_yaml::Value =
            serde_yaml::from_str(&output.stdout).map_err(|err| BackendError::MalformedOutput {
                program: self.program.clone(),
                message: err.to_string(),
            })?;
        let supported = info
            .get("environment")
            .and_then(|env| env.get("kernel_features"))
            .and_then(|features| features.get("seccomp_listener"))
            .and_then(serde_yaml::Value::as_str)
            .is_some_and(|value| value == "true");
        debug!(supported, "lxd mknod interception");
        Ok(supported)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClientFailure {
    NotFound,
    AlreadyExists,
    Unreachable,
}

impl ClientFailure {
    fn into_error(
        self,
        program: &str,
        name: &str,
        spec: &CommandSpec,
        output: &CommandOutput,
    ) -> BackendError {
        match self {
            Self::NotFound => BackendError::NotFound {
                name: name.to_owned(),
            },
            Self::AlreadyExists => BackendError::AlreadyExists {
                name: name.to_owned(),
            },
            Self::Unreachable => BackendError::Unavailable {
                program: program.to_owned(),
                message: spec.details(output).to_string(),
            },
        }
    }
}

fn client_failure(stderr: &str) -> Option<ClientFailure> {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("instance not found") || lowered.contains("error: not found") {
        Some(ClientFailure::NotFound)
    } else if lowered.contains("already exists") {
        Some(ClientFailure::AlreadyExists)
    } else if lowered.contains("unix socket")
        || lowered.contains("is the lxd daemon running")
        || lowered.contains("connection refused")
    {
        Some(ClientFailure::Unreachable)
    } else {
        None
    }
}
