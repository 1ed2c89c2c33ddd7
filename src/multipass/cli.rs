//! Thin wrapper over the `multipass` command-line client.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{BackendError, ExecutionRequest};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Mount entry of `multipass info --format json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct MountEntry {
    /// Host directory backing the mount.
    #[serde(default)]
    pub source_path: String,
}

/// Per-instance record of `multipass info --format json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct InfoEntry {
    /// Run state such as `Running` or `Stopped`.
    #[serde(default)]
    pub state: String,
    /// Assigned IPv4 addresses.
    #[serde(default)]
    pub ipv4: Vec<String>,
    /// Active mounts keyed by guest target.
    #[serde(default)]
    pub mounts: BTreeMap<String, MountEntry>,
    /// Image release description.
    #[serde(default)]
    pub release: String,
}

#[derive(Debug, Deserialize)]
struct InfoDocument {
    #[serde(default)]
    info: BTreeMap<String, InfoEntry>,
}

/// Runs `multipass` commands.
#[derive(Clone, Debug)]
pub struct Multipass<R> {
    program: String,
    control_timeout: Duration,
    runner: R,
}

impl<R: CommandRunner> Multipass<R> {
    /// Creates a client.
    #[must_use]
    pub const fn new(program: String, control_timeout: Duration, runner: R) -> Self {
        Self {
            program,
            control_timeout,
            runner,
        }
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        CommandSpec::new(self.program.clone(), args).with_timeout(Some(self.control_timeout))
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
        Err(classify(&self.program, name, brief, spec, &output))
    }

    /// Launches `image` as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass launch` fails.
    pub async fn launch(
        &self,
        name: &str,
        image: &str,
        options: &[String],
    ) -> Result<(), BackendError> {
        let mut args = vec![
            "launch".to_owned(),
            image.to_owned(),
            "--name".to_owned(),
            name.to_owned(),
        ];
        args.extend(options.iter().cloned());
        let spec = self.spec(args);
        self.run_checked(name, &format!("Failed to launch {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Describes `name`, or `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MalformedOutput`] when the JSON cannot be
    /// parsed.
    pub async fn info(&self, name: &str) -> Result<Option<InfoEntry>, BackendError> {
        let spec = self.spec(["info", name, "--format", "json"]);
        let output = self.run(&spec).await?;
        if !output.is_success() {
            if mentions_missing(&output) {
                return Ok(None);
            }
            return Err(classify(
                &self.program,
                name,
                &format!("Failed to query {name}"),
                &spec,
                &output,
            ));
        }
        let document: InfoDocument =
            serde_json::from_str(&output.stdout).map_err(|err| BackendError::MalformedOutput {
                program: self.program.clone(),
                message: err.to_string(),
            })?;
        Ok(document.info.get(name).cloned())
    }

    /// Runs a command in the instance as root without a deadline; the
    /// caller owns the timeout.
    ///
    /// A non-zero exit is checked against `multipass info` once. Only a
    /// failing query or a missing instance turns it into an error.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the `multipass` client itself fails.
    pub async fn exec(
        &self,
        name: &str,
        request: &ExecutionRequest,
    ) -> Result<CommandOutput, BackendError> {
        let mut args = vec!["exec".to_owned(), name.to_owned()];
        if let Some(cwd) = &request.cwd {
            args.push("--working-directory".to_owned());
            args.push(cwd.to_string());
        }
        args.extend(["--", "sudo", "-H", "--"].map(str::to_owned));
        args.extend(request.guest_argv());
        let spec = self
            .spec(args)
            .with_stdin(request.stdin.clone())
            .with_timeout(None);
        let output = self.run(&spec).await?;
        if output.is_success() || self.info(name).await?.is_some() {
            return Ok(output);
        }
        Err(BackendError::NotFound {
            name: name.to_owned(),
        })
    }

    /// Copies a file between host and guest. Guest paths are written as
    /// `<name>:<path>`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass transfer` fails.
    pub async fn transfer(
        &self,
        name: &str,
        source: &str,
        destination: &str,
    ) -> Result<(), BackendError> {
        let spec = self.spec(["transfer", source, destination]);
        self.run_checked(
            name,
            &format!("Failed to transfer {source} to {destination}"),
            &spec,
        )
        .await
        .map(|_| ())
    }

    /// Mounts a host directory with host ownership mapped to root.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass mount` fails.
    pub async fn mount(
        &self,
        name: &str,
        source: &str,
        target: &str,
        host_ids: Option<(u32, u32)>,
    ) -> Result<(), BackendError> {
        let mut args = vec![
            "mount".to_owned(),
            source.to_owned(),
            format!("{name}:{target}"),
        ];
        if let Some((uid, gid)) = host_ids {
            args.extend([
                "--uid-map".to_owned(),
                format!("{uid}:0"),
                "--gid-map".to_owned(),
                format!("{gid}:0"),
            ]);
        }
        let spec = self.spec(args);
        self.run_checked(name, &format!("Failed to mount {source} in {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Starts the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass start` fails.
    pub async fn start(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["start", name]);
        self.run_checked(name, &format!("Failed to start {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Stops the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass stop` fails.
    pub async fn stop(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["stop", name]);
        self.run_checked(name, &format!("Failed to stop {name}"), &spec)
            .await
            .map(|_| ())
    }

    /// Deletes and purges the instance.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when `multipass delete` fails.
    pub async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let spec = self.spec(["delete", name, "--purge"]);
        self.run_checked(name, &format!("Failed to delete {name}"), &spec)
            .await
            .map(|_| ())
    }
}

fn mentions_missing(output: &CommandOutput) -> bool {
    output.stderr.contains("does not exist") || output.stdout.contains("does not exist")
}

fn mentions_unreachable(output: &CommandOutput) -> bool {
    let lowered = output.stderr.to_ascii_lowercase();
    lowered.contains("cannot connect to the multipass socket")
        || lowered.contains("multipassd")
}

fn classify(
    program: &str,
    name: &str,
    brief: &str,
    spec: &CommandSpec,
    output: &CommandOutput,
) -> BackendError {
    if mentions_missing(output) {
        BackendError::NotFound {
            name: name.to_owned(),
        }
    } else if output.stderr.contains("already exists") {
        BackendError::AlreadyExists {
            name: name.to_owned(),
        }
    } else if mentions_unreachable(output) {
        BackendError::Unavailable {
            program: program.to_owned(),
            message: spec.details(output).to_string(),
        }
    } else {
        BackendError::Command {
            brief: brief.to_owned(),
            details: spec.details(output),
        }
    }
}
