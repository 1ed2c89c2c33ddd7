//! In-process [`Backend`] whose guests are directories on the host.
//!
//! Each instance gets a private directory that stands in for its root
//! filesystem. Guest commands are interpreted against that directory, so
//! transfers, configuration steps and cleanup can be asserted by looking at
//! real files. Faults are injected through the `with_*` builders.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tempfile::TempDir;

use crate::backend::{
    Backend, BackendError, BackendFuture, BackendKind, CommandDetails, ExecutionRequest,
    FileTransfer, InstanceName, InstanceStatus, LaunchRequest, MountSpec, ReadinessStage,
    ReadyState, RunState, TransferDirection,
};
use crate::process::CommandOutput;

const RESOLVE_FAILURE: &str = "Err:1 http://archive.ubuntu.com jammy InRelease\n  \
Temporary failure resolving 'archive.ubuntu.com'";

/// `/etc/os-release` of an Ubuntu 22.04 guest.
pub const UBUNTU_JAMMY_OS_RELEASE: &str = "PRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\n\
NAME=\"Ubuntu\"\n\
VERSION_ID=\"22.04\"\n\
VERSION=\"22.04.4 LTS (Jammy Jellyfish)\"\n\
ID=ubuntu\n\
ID_LIKE=debian\n";

#[derive(Clone, Debug, Default)]
struct Faults {
    not_ready: BTreeMap<ReadinessStage, u32>,
    never_ready: Option<ReadinessStage>,
    transient_probe_errors: u32,
    vanish: bool,
    unavailable: bool,
    launch_failure: Option<String>,
    slow_launch: Option<Duration>,
    failing_pushes: bool,
    failing_extraction: bool,
    network_failures: u32,
    snapd_network_failures: u32,
    fatal_install: bool,
    missing_snaps: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
struct Guest {
    running: bool,
    mounts: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct SimState {
    faults: Faults,
    os_release: String,
    guests: BTreeMap<String, Guest>,
    launches: u32,
    starts: u32,
    stops: u32,
    deletes: u32,
    install_runs: u32,
    snaps: BTreeMap<String, bool>,
    probes: BTreeMap<ReadinessStage, u32>,
    executions: Vec<ExecutionRequest>,
}

/// Simulated backend with inspectable guests and injectable faults.
#[derive(Clone, Debug)]
pub struct SimulatedBackend {
    kind: BackendKind,
    root: Arc<TempDir>,
    state: Arc<Mutex<SimState>>,
}

fn bump(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

fn output(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn ok() -> CommandOutput {
    output(0, "", "")
}

fn io_failure(argv: &[&str], err: &io::Error) -> CommandOutput {
    let program = argv.first().copied().unwrap_or("command");
    output(1, "", format!("{program}: {err}"))
}

fn unavailable() -> BackendError {
    BackendError::Unavailable {
        program: "simulated".to_owned(),
        message: "cannot reach the simulated daemon".to_owned(),
    }
}

fn not_found(name: &str) -> BackendError {
    BackendError::NotFound {
        name: name.to_owned(),
    }
}

fn command_error(brief: &str, command: &str, stderr: &str) -> BackendError {
    BackendError::Command {
        brief: brief.to_owned(),
        details: CommandDetails {
            command: command.to_owned(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        },
    }
}

/// Drops the `timeout --signal=KILL Ns` wrapper the executor adds.
fn strip_timeout(command: &[String]) -> Vec<String> {
    match command {
        [program, signal, _limit, rest @ ..]
            if program == "timeout" && signal.starts_with("--signal") =>
        {
            rest.to_vec()
        }
        other => other.to_vec(),
    }
}

fn operands<'a>(args: &[&'a str]) -> Vec<&'a str> {
    args.iter()
        .copied()
        .filter(|arg| !arg.starts_with('-'))
        .collect()
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

impl SimulatedBackend {
    /// Creates a healthy LXD-flavoured backend with no instances.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing temporary directory cannot be
    /// created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            kind: BackendKind::Lxd,
            root: Arc::new(TempDir::new()?),
            state: Arc::new(Mutex::new(SimState {
                os_release: UBUNTU_JAMMY_OS_RELEASE.to_owned(),
                ..SimState::default()
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_faults(self, change: impl FnOnce(&mut Faults)) -> Self {
        change(&mut self.lock().faults);
        self
    }

    /// Reports `kind` from [`Backend::kind`].
    #[must_use]
    pub const fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Serves `content` as the guest's `/etc/os-release`.
    #[must_use]
    pub fn with_os_release(self, content: impl Into<String>) -> Self {
        self.lock().os_release = content.into();
        self
    }

    /// Answers `polls` probes of `stage` with not-ready before passing.
    #[must_use]
    pub fn with_not_ready(self, stage: ReadinessStage, polls: u32) -> Self {
        self.with_faults(|faults| {
            faults.not_ready.insert(stage, polls);
        })
    }

    /// Never lets `stage` pass.
    #[must_use]
    pub fn with_never_ready(self, stage: ReadinessStage) -> Self {
        self.with_faults(|faults| faults.never_ready = Some(stage))
    }

    /// Fails the next `count` probes with a transient command error.
    #[must_use]
    pub fn with_transient_probe_errors(self, count: u32) -> Self {
        self.with_faults(|faults| faults.transient_probe_errors = count)
    }

    /// Makes the instance disappear on the first readiness probe.
    #[must_use]
    pub fn with_vanishing_instance(self) -> Self {
        self.with_faults(|faults| faults.vanish = true)
    }

    /// Makes every call fail as though the daemon were unreachable.
    #[must_use]
    pub fn with_unavailable_daemon(self) -> Self {
        self.with_faults(|faults| faults.unavailable = true)
    }

    /// Brings an unavailable daemon back.
    #[must_use]
    pub fn with_available_daemon(self) -> Self {
        self.with_faults(|faults| faults.unavailable = false)
    }

    /// Fails every launch with `stderr`.
    #[must_use]
    pub fn with_launch_failure(self, stderr: impl Into<String>) -> Self {
        let message = stderr.into();
        self.with_faults(|faults| faults.launch_failure = Some(message))
    }

    /// Makes each launch take `delay`.
    #[must_use]
    pub fn with_slow_launch(self, delay: Duration) -> Self {
        self.with_faults(|faults| faults.slow_launch = Some(delay))
    }

    /// Fails every host-to-guest copy.
    #[must_use]
    pub fn with_failing_pushes(self) -> Self {
        self.with_faults(|faults| faults.failing_pushes = true)
    }

    /// Makes `tar -xf` write part of the tree and then fail.
    #[must_use]
    pub fn with_failing_extraction(self) -> Self {
        self.with_faults(|faults| faults.failing_extraction = true)
    }

    /// Fails the next `count` package manager runs with a DNS error.
    #[must_use]
    pub fn with_network_failures(self, count: u32) -> Self {
        self.with_faults(|faults| faults.network_failures = count)
    }

    /// Fails the next `count` attempts to install snapd with a DNS error.
    #[must_use]
    pub fn with_snapd_network_failures(self, count: u32) -> Self {
        self.with_faults(|faults| faults.snapd_network_failures = count)
    }

    /// Makes the store report `snap` as unknown.
    #[must_use]
    pub fn with_missing_snap(self, snap: &str) -> Self {
        let missing = snap.to_owned();
        self.with_faults(|faults| {
            faults.missing_snaps.insert(missing);
        })
    }

    /// Fails every package manager run with an unknown-package error.
    #[must_use]
    pub fn with_fatal_install(self) -> Self {
        self.with_faults(|faults| faults.fatal_install = true)
    }

    /// Registers a running instance called `name` that kiln did not create.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest directory cannot be created.
    pub fn with_existing(self, name: &str) -> io::Result<Self> {
        self.provision(name)?;
        self.lock().guests.insert(
            name.to_owned(),
            Guest {
                running: true,
                mounts: BTreeSet::new(),
            },
        );
        Ok(self)
    }

    /// Host location of `guest_path` inside instance `name`.
    #[must_use]
    pub fn guest_path(&self, name: &str, guest_path: &str) -> PathBuf {
        self.root
            .path()
            .join(name)
            .join(guest_path.trim_start_matches('/'))
    }

    /// Reads a guest file as text.
    #[must_use]
    pub fn read_guest(&self, name: &str, guest_path: &str) -> Option<String> {
        fs::read_to_string(self.guest_path(name, guest_path)).ok()
    }

    /// Writes a guest file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn write_guest(&self, name: &str, guest_path: &str, content: &str) -> io::Result<()> {
        let path = self.guest_path(name, guest_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }

    /// Names of the entries in a guest directory, sorted.
    #[must_use]
    pub fn list_guest(&self, name: &str, guest_dir: &str) -> Vec<String> {
        let mut entries: Vec<String> = fs::read_dir(self.guest_path(name, guest_dir))
            .map(|read| {
                read.filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        entries
    }

    /// Returns `true` while the backend knows about `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.lock().guests.contains_key(name)
    }

    /// Returns `true` when `name` exists and is running.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.lock().guests.get(name).is_some_and(|guest| guest.running)
    }

    /// Guest targets mounted into `name`.
    #[must_use]
    pub fn mounts(&self, name: &str) -> Vec<String> {
        self.lock()
            .guests
            .get(name)
            .map(|guest| guest.mounts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of launches accepted.
    #[must_use]
    pub fn launches(&self) -> u32 {
        self.lock().launches
    }

    /// Number of starts performed.
    #[must_use]
    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    /// Number of stops that changed a running instance.
    #[must_use]
    pub fn stops(&self) -> u32 {
        self.lock().stops
    }

    /// Number of deletes that removed an instance.
    #[must_use]
    pub fn deletes(&self) -> u32 {
        self.lock().deletes
    }

    /// Number of package manager runs.
    #[must_use]
    pub fn install_runs(&self) -> u32 {
        self.lock().install_runs
    }

    /// Installed snaps, mapped to whether they use classic confinement.
    #[must_use]
    pub fn installed_snaps(&self) -> BTreeMap<String, bool> {
        self.lock().snaps.clone()
    }

    /// Number of probes issued for `stage`.
    #[must_use]
    pub fn probe_count(&self, stage: ReadinessStage) -> u32 {
        self.lock().probes.get(&stage).copied().unwrap_or_default()
    }

    /// Every execution request received, in order.
    #[must_use]
    pub fn executions(&self) -> Vec<ExecutionRequest> {
        self.lock().executions.clone()
    }

    /// Guest commands received, without the timeout wrapper.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<String> {
        self.lock()
            .executions
            .iter()
            .map(|request| strip_timeout(&request.command).join(" "))
            .collect()
    }

    fn provision(&self, name: &str) -> io::Result<()> {
        for dir in ["etc", "tmp", "root"] {
            fs::create_dir_all(self.guest_path(name, dir))?;
        }
        let os_release = self.lock().os_release.clone();
        fs::write(self.guest_path(name, "/etc/os-release"), os_release)
    }

    fn install(&self, argv: &[&str]) -> CommandOutput {
        let mut state = self.lock();
        bump(&mut state.install_runs);
        if state.faults.fatal_install {
            return output(100, "", "E: Unable to locate package kiln-missing");
        }
        let snapd = argv.contains(&"snapd") && state.faults.snapd_network_failures > 0;
        if snapd {
            state.faults.snapd_network_failures =
                state.faults.snapd_network_failures.saturating_sub(1);
            return output(100, "", RESOLVE_FAILURE);
        }
        if state.faults.network_failures > 0 {
            state.faults.network_failures = state.faults.network_failures.saturating_sub(1);
            return output(100, "", RESOLVE_FAILURE);
        }
        ok()
    }

    fn download_snap(&self, name: &str, snap: &str, options: &[&str]) -> io::Result<CommandOutput> {
        if self.lock().faults.missing_snaps.contains(snap) {
            return Ok(output(1, "", format!("error: snap \"{snap}\" not found")));
        }
        let option = |prefix: &str| options.iter().find_map(|opt| opt.strip_prefix(prefix));
        let target = option("--target-directory=").unwrap_or("/root");
        let basename = option("--basename=").unwrap_or(snap);
        let file = self.guest_path(name, &format!("{target}/{basename}.snap"));
        fs::write(file, format!("{snap}\n"))?;
        Ok(ok())
    }

    fn install_snap(&self, name: &str, args: &[&str]) -> CommandOutput {
        let Some(file) = args.iter().find(|arg| !arg.starts_with("--")) else {
            return output(1, "", "error: the required argument `<snap>` was not provided");
        };
        if !args.contains(&"--dangerous") {
            return output(1, "", "error: cannot find signatures with metadata for snap");
        }
        let path = self.guest_path(name, file);
        let stem = if path.is_file() { path.file_stem() } else { None };
        let Some(snap) = stem.map(|found| found.to_string_lossy().into_owned()) else {
            return output(1, "", format!("error: cannot open \"{file}\""));
        };
        self.lock().snaps.insert(snap, args.contains(&"--classic"));
        ok()
    }

    fn extract(&self, name: &str, archive: &str, dir: &str) -> io::Result<CommandOutput> {
        let target = self.guest_path(name, dir);
        if self.lock().faults.failing_extraction {
            fs::create_dir_all(&target)?;
            fs::write(target.join("partial"), "half written")?;
            return Ok(output(2, "", "tar: Unexpected EOF in archive"));
        }
        let file = fs::File::open(self.guest_path(name, archive))?;
        tar::Archive::new(file).unpack(&target)?;
        Ok(ok())
    }

    fn pack(&self, name: &str, archive: &str, dir: &str) -> io::Result<CommandOutput> {
        let file = fs::File::create(self.guest_path(name, archive))?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", self.guest_path(name, dir))?;
        builder.finish()?;
        Ok(ok())
    }

    fn run_guest(&self, name: &str, argv: &[&str], request: &ExecutionRequest) -> CommandOutput {
        let path = |guest: &str| self.guest_path(name, guest);
        let result: io::Result<CommandOutput> = match argv {
            ["cat"] => Ok(output(
                0,
                String::from_utf8_lossy(request.stdin.as_deref().unwrap_or_default()),
                "",
            )),
            ["cat", file] => match fs::read_to_string(path(file)) {
                Ok(content) => Ok(output(0, content, "")),
                Err(_) => Ok(output(1, "", format!("cat: {file}: No such file or directory"))),
            },
            ["echo", words @ ..] => Ok(output(0, format!("{}\n", words.join(" ")), "")),
            ["true"] => Ok(ok()),
            ["false"] => Ok(output(1, "", "")),
            ["pwd"] => Ok(output(
                0,
                format!("{}\n", request.cwd.as_ref().map_or("/root", |cwd| cwd.as_str())),
                "",
            )),
            ["printenv", key] => Ok(request.env.get(*key).map_or_else(
                || output(1, "", ""),
                |value| output(0, format!("{value}\n"), ""),
            )),
            ["sh", "-c", script] => Ok(script
                .strip_prefix("exit ")
                .and_then(|code| code.trim().parse().ok())
                .map_or_else(ok, |code| output(code, "", ""))),
            ["mkdir", "-p", dirs @ ..] => dirs
                .iter()
                .try_for_each(|dir| fs::create_dir_all(path(dir)))
                .map(|()| ok()),
            ["rm", rest @ ..] => operands(rest)
                .iter()
                .try_for_each(|target| remove_path(&path(target)))
                .map(|()| ok()),
            ["mv", rest @ ..] => match operands(rest).as_slice() {
                [from, to] => fs::rename(path(from), path(to)).map(|()| ok()),
                _ => Ok(output(1, "", "mv: missing operand")),
            },
            ["cp", rest @ ..] => match operands(rest).as_slice() {
                [from, to] => fs::copy(path(from), path(to)).map(|_| ok()),
                _ => Ok(output(1, "", "cp: missing operand")),
            },
            ["chmod" | "chown", _, target] => Ok(if path(target).exists() {
                ok()
            } else {
                output(1, "", format!("{target}: No such file or directory"))
            }),
            ["tar", "-xf", archive, "-C", dir] => self.extract(name, archive, dir),
            ["tar", "-cf", archive, "-C", dir, "."] => self.pack(name, archive, dir),
            ["test", "-d", target] => Ok(output(i32::from(!path(target).is_dir()), "", "")),
            ["test", "-f", target] => Ok(output(i32::from(!path(target).is_file()), "", "")),
            ["hostname", "-F", _] | ["systemctl", _, _] | ["ln", "-sf", _, _] => Ok(ok()),
            ["apt-get", "update"] | ["apt-get", "install", ..] | ["dnf", "install", ..] => {
                Ok(self.install(argv))
            }
            ["snap", "wait", "system", "seed.loaded"] => Ok(ok()),
            ["snap", "download", snap, options @ ..] => self.download_snap(name, snap, options),
            ["snap", "install", args @ ..] => Ok(self.install_snap(name, args)),
            [program, ..] => Ok(output(127, "", format!("{program}: command not found"))),
            [] => Ok(output(127, "", "empty command")),
        };
        result.unwrap_or_else(|err| io_failure(argv, &err))
    }

    fn require(&self, name: &str) -> Result<(), BackendError> {
        let state = self.lock();
        if state.faults.unavailable {
            return Err(unavailable());
        }
        if state.guests.contains_key(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }
}

impl Backend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            request.validate()?;
            let name = request.name.as_str();
            let delay = {
                let mut state = self.lock();
                if state.faults.unavailable {
                    return Err(unavailable());
                }
                if state.guests.contains_key(name) {
                    return Err(BackendError::AlreadyExists {
                        name: name.to_owned(),
                    });
                }
                if let Some(stderr) = &state.faults.launch_failure {
                    return Err(command_error(
                        &format!("Failed to launch {name}"),
                        &format!("simulated launch {name}"),
                        stderr,
                    ));
                }
                bump(&mut state.launches);
                state.faults.slow_launch
            };
            if let Some(delay_value) = delay {
                tokio::time::sleep(delay_value).await;
            }
            self.provision(name).map_err(|err| BackendError::Io {
                path: name.to_owned(),
                message: err.to_string(),
            })?;
            self.lock().guests.insert(
                name.to_owned(),
                Guest {
                    running: true,
                    mounts: BTreeSet::new(),
                },
            );
            Ok(())
        })
    }

    fn status<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, Option<InstanceStatus>> {
        Box::pin(async move {
            let state = self.lock();
            if state.faults.unavailable {
                return Err(unavailable());
            }
            Ok(state.guests.get(name.as_str()).map(|guest| InstanceStatus {
                state: if guest.running {
                    RunState::Running
                } else {
                    RunState::Stopped
                },
                addresses: vec!["10.10.0.2".to_owned()],
            }))
        })
    }

    fn probe_ready<'a>(
        &'a self,
        name: &'a InstanceName,
        stage: ReadinessStage,
    ) -> BackendFuture<'a, ReadyState> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.faults.unavailable {
                return Err(unavailable());
            }
            bump(state.probes.entry(stage).or_default());
            if state.faults.vanish {
                state.guests.remove(name.as_str());
                return Err(not_found(name.as_str()));
            }
            let Some(running) = state.guests.get(name.as_str()).map(|guest| guest.running) else {
                return Err(not_found(name.as_str()));
            };
            if !running {
                return Ok(ReadyState::not_ready("status is stopped"));
            }
            if state.faults.transient_probe_errors > 0 {
                state.faults.transient_probe_errors =
                    state.faults.transient_probe_errors.saturating_sub(1);
                return Err(command_error(
                    "probe failed",
                    "simulated probe",
                    "connection reset by peer",
                ));
            }
            if state.faults.never_ready == Some(stage) {
                return Ok(ReadyState::not_ready(format!("{stage} never settles")));
            }
            if let Some(remaining) = state.faults.not_ready.get_mut(&stage) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Ok(ReadyState::not_ready(format!("{stage} still settling")));
                }
            }
            Ok(ReadyState::Ready)
        })
    }

    fn execute<'a>(
        &'a self,
        name: &'a InstanceName,
        request: &'a ExecutionRequest,
    ) -> BackendFuture<'a, CommandOutput> {
        Box::pin(async move {
            self.require(name.as_str())?;
            self.lock().executions.push(request.clone());
            let command = strip_timeout(&request.command);
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            if let ["sleep", seconds] = argv.as_slice() {
                let secs = seconds.parse().unwrap_or_default();
                tokio::time::sleep(Duration::from_secs(secs)).await;
                return Ok(ok());
            }
            Ok(self.run_guest(name.as_str(), &argv, request))
        })
    }

    fn transfer<'a>(
        &'a self,
        name: &'a InstanceName,
        transfer: &'a FileTransfer,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.require(name.as_str())?;
            let guest = self.guest_path(name.as_str(), transfer.guest_path.as_str());
            let host = transfer.host_path.as_std_path();
            let copied = match transfer.direction {
                TransferDirection::Push => {
                    if self.lock().faults.failing_pushes {
                        return Err(command_error(
                            &format!("Failed to push {} to {name}", transfer.host_path),
                            "simulated file push",
                            "Error: write failed: no space left on device",
                        ));
                    }
                    fs::copy(host, &guest)
                }
                TransferDirection::Pull => fs::copy(&guest, host),
            };
            copied.map(|_| ()).map_err(|err| BackendError::Io {
                path: transfer.guest_path.to_string(),
                message: err.to_string(),
            })
        })
    }

    fn mount<'a>(&'a self, name: &'a InstanceName, spec: &'a MountSpec) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.require(name.as_str())?;
            if let Some(guest) = self.lock().guests.get_mut(name.as_str()) {
                guest.mounts.insert(spec.guest_target.to_string());
            }
            Ok(())
        })
    }

    fn start<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.require(name.as_str())?;
            let mut state = self.lock();
            bump(&mut state.starts);
            if let Some(guest) = state.guests.get_mut(name.as_str()) {
                guest.running = true;
            }
            Ok(())
        })
    }

    fn stop<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.faults.unavailable {
                return Err(unavailable());
            }
            let was_running = match state.guests.get_mut(name.as_str()) {
                Some(guest) if guest.running => {
                    guest.running = false;
                    true
                }
                _ => false,
            };
            if was_running {
                bump(&mut state.stops);
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                if state.faults.unavailable {
                    return Err(unavailable());
                }
                if state.guests.remove(name.as_str()).is_none() {
                    return Ok(());
                }
                bump(&mut state.deletes);
            }
            remove_path(&self.guest_path(name.as_str(), "/")).map_err(|err| BackendError::Io {
                path: name.to_string(),
                message: err.to_string(),
            })
        })
    }
}
