//! Unit tests for base validation and prerequisite installation.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::backend::InstanceName;
use crate::test_support::SimulatedBackend;

const FEDORA_OS_RELEASE: &str = "NAME=\"Fedora Linux\"\nVERSION_ID=40\nID=fedora\n";

#[fixture]
fn name() -> InstanceName {
    InstanceName::parse("box").expect("valid name")
}

fn instance(sim: SimulatedBackend) -> SimulatedBackend {
    sim.with_existing("box").expect("existing instance")
}

fn healthy() -> SimulatedBackend {
    instance(SimulatedBackend::new().expect("simulated backend"))
}

fn configurer(base: Base) -> BaseConfigurer {
    BaseConfigurer::new(
        base,
        RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .with_jitter_percent(0),
        3,
    )
}

fn executor<'a>(
    sim: &'a SimulatedBackend,
    name: &'a InstanceName,
    base: &Base,
) -> Executor<'a, SimulatedBackend> {
    Executor::new(
        sim,
        name,
        base.command_environment(),
        None,
        Duration::from_secs(60),
    )
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn configures_a_fresh_ubuntu_guest(name: InstanceName) {
    let sim = healthy();
    let base = Base::ubuntu("22.04").with_hostname("builder");
    let mut subject = configurer(base.clone());

    subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect("configuration should succeed");

    assert_eq!(subject.state(), ConfigureState::Configured);
    let record = sim
        .read_guest("box", COMPATIBILITY_FILE)
        .expect("compatibility record written");
    assert_eq!(
        CompatibilityRecord::from_yaml(&record).expect("record parses"),
        CompatibilityRecord::for_base(&base)
    );
    assert_eq!(sim.read_guest("box", "/etc/hostname").as_deref(), Some("builder\n"));
    assert!(
        sim.read_guest("box", "/etc/environment")
            .is_some_and(|env| env.contains("PATH=/usr/local/sbin"))
    );
    assert_eq!(sim.install_runs(), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn configured_instances_are_left_alone(name: InstanceName) {
    let sim = healthy();
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());
    let exec = executor(&sim, &name, &base);
    subject.configure(&exec).await.expect("first configuration");
    let commands = sim.executions().len();

    subject.configure(&exec).await.expect("second call is a no-op");

    assert_eq!(sim.executions().len(), commands);
    assert_eq!(sim.install_runs(), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejects_a_guest_running_another_distribution(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_os_release(FEDORA_OS_RELEASE),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    let err = subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect_err("fedora is not ubuntu");

    let ProviderError::BaseValidation { reason, .. } = err else {
        panic!("expected a validation error, got {err}");
    };
    assert!(reason.contains("fedora:40"), "{reason}");
    assert_eq!(subject.state(), ConfigureState::Failed);
    assert_eq!(sim.install_runs(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejects_a_guest_prepared_by_another_recipe(name: InstanceName) {
    let sim = healthy();
    sim.write_guest("box", COMPATIBILITY_FILE, "compatibility_tag: kiln-base-v0\n")
        .expect("stale record");
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    let err = subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect_err("tags differ");

    let ProviderError::BaseValidation { reason, .. } = &err else {
        panic!("expected a validation error, got {err}");
    };
    assert!(reason.contains("kiln-base-v0"), "{reason}");
    assert_eq!(sim.install_runs(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn accepts_a_guest_prepared_by_the_same_recipe(name: InstanceName) {
    let sim = healthy();
    let base = Base::ubuntu("22.04");
    let record = CompatibilityRecord::for_base(&base)
        .to_yaml()
        .expect("record serialises");
    sim.write_guest("box", COMPATIBILITY_FILE, &record)
        .expect("matching record");
    let mut subject = configurer(base.clone());

    subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect("matching tag is accepted");

    assert_eq!(subject.state(), ConfigureState::Configured);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retries_transient_network_failures(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_network_failures(1),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect("second attempt succeeds");

    assert_eq!(sim.install_runs(), 5);
    assert_eq!(subject.state(), ConfigureState::Configured);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn sets_up_systemd_networking_and_snapd(name: InstanceName) {
    let sim = healthy();
    let base = Base::ubuntu("24.04");
    let mut subject = configurer(base.clone());

    subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect("configuration should succeed");

    let network = sim
        .read_guest("box", "/etc/systemd/network/10-eth0.network")
        .expect("networkd configuration written");
    assert!(network.contains("Name=eth0"));
    let commands = sim.executed_commands();
    let position = |wanted: &str| {
        commands
            .iter()
            .position(|command| command == wanted)
            .unwrap_or_else(|| panic!("{wanted} was not run"))
    };
    assert!(position("systemctl restart systemd-resolved") < position("apt-get update"));
    assert!(position("systemctl restart systemd-networkd") < position("apt-get update"));
    assert!(position("apt-get install -y snapd") < position("systemctl restart snapd.service"));
    assert!(
        position("systemctl restart snapd.service") < position("snap wait system seed.loaded")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retries_snapd_installation_on_network_failures(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_snapd_network_failures(2),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect("third snapd attempt succeeds");

    let snapd_runs = sim
        .executed_commands()
        .iter()
        .filter(|command| command.as_str() == "apt-get install -y snapd")
        .count();
    assert_eq!(snapd_runs, 3);
    assert_eq!(sim.install_runs(), 6);
    assert_eq!(subject.state(), ConfigureState::Configured);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reports_snapd_installation_that_never_succeeds(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_snapd_network_failures(10),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    let err = subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect_err("snapd never installs");

    let ProviderError::BaseInstallation { step, attempts, .. } = &err else {
        panic!("expected an installation error, got {err}");
    };
    assert_eq!((step.as_str(), *attempts), ("install snapd", 3));
    assert!(!sim.executed_commands().iter().any(|command| command.starts_with("snap wait")));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn gives_up_after_the_attempt_limit(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_network_failures(10),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    let err = subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect_err("network never recovers");

    let ProviderError::BaseInstallation {
        step,
        attempts,
        details,
        ..
    } = err
    else {
        panic!("expected an installation error, got {err}");
    };
    assert_eq!(step, "refresh package lists");
    assert_eq!(attempts, 3);
    assert!(details.contains("Temporary failure resolving"), "{details}");
    assert_eq!(sim.install_runs(), 3);
    assert_eq!(subject.state(), ConfigureState::Failed);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn does_not_retry_fatal_failures(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_fatal_install(),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());

    let err = subject
        .configure(&executor(&sim, &name, &base))
        .await
        .expect_err("unknown package");

    assert!(
        matches!(err, ProviderError::BaseInstallation { attempts: 1, .. }),
        "{err}"
    );
    assert_eq!(sim.install_runs(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_configuration_is_not_resumed(name: InstanceName) {
    let sim = instance(
        SimulatedBackend::new()
            .expect("simulated backend")
            .with_fatal_install(),
    );
    let base = Base::ubuntu("22.04");
    let mut subject = configurer(base.clone());
    let exec = executor(&sim, &name, &base);
    subject
        .configure(&exec)
        .await
        .expect_err("first attempt fails");

    let err = subject.configure(&exec).await.expect_err("still failed");

    assert!(err.to_string().contains("an earlier configuration attempt failed"), "{err}");
    assert_eq!(sim.install_runs(), 1);
}

fn result(exit_code: i32, stdout: &str, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code,
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
        duration: Duration::ZERO,
    }
}

#[rstest]
#[case(
    result(100, "", "Temporary failure resolving 'archive.ubuntu.com'"),
    FailureClass::Transient
)]
#[case(result(1, "Curl error (6): Could not resolve host", ""), FailureClass::Transient)]
#[case(result(100, "", "E: Unable to locate package nope"), FailureClass::Fatal)]
#[case(result(127, "", "Failed to fetch"), FailureClass::Fatal)]
#[case(result(1, "", "Permission denied"), FailureClass::Fatal)]
fn classifies_install_failures(#[case] failed: ExecutionResult, #[case] expected: FailureClass) {
    assert_eq!(FailureClass::of(&failed), expected);
}
