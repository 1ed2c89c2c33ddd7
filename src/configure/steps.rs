//! Prerequisite recipe for each package-manager family.

use crate::backend::ExecutionRequest;
use crate::base::{Base, PackageManager};

const NO_RECOMMENDS: &str = "APT::Install-Recommends \"false\";\n";

/// DHCP configuration for the guest's primary interface.
const ETH0_NETWORK: &str = "\
[Match]
Name=eth0

[Network]
DHCP=ipv4
LinkLocalAddressing=ipv6

[DHCP]
RouteMetric=100
UseMTU=true
";

/// One action taken while installing prerequisites.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstallStep {
    /// Write a guest file atomically.
    WriteFile {
        /// Absolute guest path.
        path: &'static str,
        /// File content.
        content: String,
        /// Octal permission bits.
        mode: &'static str,
    },
    /// Run a command, retrying transient network failures.
    Run {
        /// Short description used in errors and logs.
        label: String,
        /// Command to run.
        request: ExecutionRequest,
    },
}

impl InstallStep {
    fn run<I, S>(label: &str, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run {
            label: label.to_owned(),
            request: ExecutionRequest::new(command),
        }
    }

    fn apt_install<I, S>(label: &str, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec!["apt-get".to_owned(), "install".to_owned(), "-y".to_owned()];
        command.extend(packages.into_iter().map(Into::into));
        Self::Run {
            label: label.to_owned(),
            request: ExecutionRequest::new(command).env("DEBIAN_FRONTEND", "noninteractive"),
        }
    }
}

/// Hands DNS to systemd-resolved and brings eth0 up through
/// systemd-networkd.
fn systemd_network_steps() -> Vec<InstallStep> {
    vec![
        InstallStep::run(
            "link resolv.conf",
            ["ln", "-sf", "/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"],
        ),
        InstallStep::run("enable systemd-resolved", ["systemctl", "enable", "systemd-resolved"]),
        InstallStep::run(
            "restart systemd-resolved",
            ["systemctl", "restart", "systemd-resolved"],
        ),
        InstallStep::WriteFile {
            path: "/etc/systemd/network/10-eth0.network",
            content: ETH0_NETWORK.to_owned(),
            mode: "0644",
        },
        InstallStep::run("enable systemd-networkd", ["systemctl", "enable", "systemd-networkd"]),
        InstallStep::run(
            "restart systemd-networkd",
            ["systemctl", "restart", "systemd-networkd"],
        ),
    ]
}

/// Installs snapd and waits until it has loaded its seed.
fn snapd_steps() -> Vec<InstallStep> {
    vec![
        InstallStep::apt_install("install snapd dependencies", ["fuse", "udev"]),
        InstallStep::run("enable systemd-udevd", ["systemctl", "enable", "systemd-udevd"]),
        InstallStep::run("start systemd-udevd", ["systemctl", "start", "systemd-udevd"]),
        InstallStep::apt_install("install snapd", ["snapd"]),
        InstallStep::run("start snapd socket", ["systemctl", "start", "snapd.socket"]),
        // Restart rather than start so a running service sees the new environment.
        InstallStep::run("restart snapd", ["systemctl", "restart", "snapd.service"]),
        InstallStep::run("wait for snapd seeding", ["snap", "wait", "system", "seed.loaded"]),
    ]
}

/// Steps that prepare a guest for `base`, in order.
#[must_use]
pub fn prerequisite_steps(base: &Base) -> Vec<InstallStep> {
    let environment: String = base
        .command_environment()
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    let mut steps = vec![
        InstallStep::WriteFile {
            path: "/etc/environment",
            content: environment,
            mode: "0644",
        },
        InstallStep::WriteFile {
            path: "/etc/hostname",
            content: format!("{}\n", base.hostname),
            mode: "0644",
        },
        InstallStep::run("set hostname", ["hostname", "-F", "/etc/hostname"]),
    ];
    match base.package_manager() {
        Some(PackageManager::Apt) => {
            steps.extend(systemd_network_steps());
            steps.push(InstallStep::WriteFile {
                path: "/etc/apt/apt.conf.d/00no-recommends",
                content: NO_RECOMMENDS.to_owned(),
                mode: "0644",
            });
            steps.push(InstallStep::run(
                "refresh package lists",
                ["apt-get", "update"],
            ));
            if !base.packages.is_empty() {
                let packages = base.packages.iter().cloned();
                steps.push(InstallStep::apt_install("install packages", packages));
            }
            steps.extend(snapd_steps());
        }
        Some(PackageManager::Dnf) => {
            if !base.packages.is_empty() {
                let mut command = vec!["dnf".to_owned(), "install".to_owned(), "-y".to_owned()];
                command.extend(base.packages.iter().cloned());
                steps.push(InstallStep::run("install packages", command));
            }
        }
        None => {}
    }
    steps
}
