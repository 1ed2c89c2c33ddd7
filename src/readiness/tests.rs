//! Unit tests for staged readiness polling.

use std::time::Duration;

use super::*;
use crate::backend::BackendError;
use crate::test_support::SimulatedBackend;
use rstest::{fixture, rstest};

#[fixture]
fn name() -> InstanceName {
    InstanceName::parse("box").expect("valid name")
}

fn waiter(timeout: Duration) -> ReadinessWaiter {
    ReadinessWaiter::new(
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), timeout)
            .with_jitter_percent(0),
    )
}

fn backend() -> SimulatedBackend {
    SimulatedBackend::new()
        .expect("simulated backend")
        .with_existing("box")
        .expect("existing instance")
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn passes_every_stage_in_order(name: InstanceName) {
    let sim = backend();

    waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect("instance should become ready");

    for stage in ReadinessStage::ALL {
        assert_eq!(sim.probe_count(stage), 1, "{stage} probed once");
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retries_until_a_slow_stage_settles(name: InstanceName) {
    let sim = backend().with_not_ready(ReadinessStage::Network, 3);

    waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect("network should settle");

    assert_eq!(sim.probe_count(ReadinessStage::Boot), 1);
    assert_eq!(sim.probe_count(ReadinessStage::Network), 4);
    assert_eq!(sim.probe_count(ReadinessStage::InitSystem), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn later_stages_wait_for_earlier_ones(name: InstanceName) {
    let sim = backend().with_never_ready(ReadinessStage::Boot);

    let err = waiter(Duration::from_secs(4))
        .wait(&sim, &name)
        .await
        .expect_err("boot never completes");

    assert!(matches!(
        err,
        ProviderError::ReadinessTimeout {
            stage: ReadinessStage::Boot,
            ..
        }
    ));
    assert_eq!(sim.probe_count(ReadinessStage::Network), 0);
    assert_eq!(sim.probe_count(ReadinessStage::InitSystem), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn a_slow_boot_may_use_most_of_the_deadline(name: InstanceName) {
    let sim = backend().with_not_ready(ReadinessStage::Boot, 7);
    let second = Duration::from_secs(1);
    let steady = RetryPolicy::new(second, second, Duration::from_secs(10)).with_jitter_percent(0);
    let started = Instant::now();

    ReadinessWaiter::new(steady)
        .wait(&sim, &name)
        .await
        .expect("boot settles before the overall deadline");

    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(sim.probe_count(ReadinessStage::Boot), 8);
    assert_eq!(sim.probe_count(ReadinessStage::InitSystem), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn a_stage_that_never_passes_uses_the_whole_deadline(name: InstanceName) {
    let sim = backend().with_never_ready(ReadinessStage::Boot);

    let err = waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect_err("boot never completes");

    let ProviderError::ReadinessTimeout { waited, .. } = err else {
        panic!("expected a readiness timeout, got {err}");
    };
    assert!(waited >= Duration::from_secs(10), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(10_100), "waited {waited:?}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timeout_reports_the_last_observation(name: InstanceName) {
    let sim = backend().with_never_ready(ReadinessStage::InitSystem);

    let err = waiter(Duration::from_secs(6))
        .wait(&sim, &name)
        .await
        .expect_err("init system never settles");

    let ProviderError::ReadinessTimeout {
        stage, last_state, waited, ..
    } = err
    else {
        panic!("expected a readiness timeout, got {err}");
    };
    assert_eq!(stage, ReadinessStage::InitSystem);
    assert_eq!(
        last_state,
        ReadyState::not_ready("init system never settles")
    );
    assert!(waited <= Duration::from_millis(6100), "waited {waited:?}");
    assert!(sim.probe_count(ReadinessStage::InitSystem) > 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transient_probe_errors_are_retried(name: InstanceName) {
    let sim = backend().with_transient_probe_errors(2);

    waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect("transient errors should be absorbed");

    assert_eq!(sim.probe_count(ReadinessStage::Boot), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn vanished_instance_fails_without_retrying(name: InstanceName) {
    let sim = backend().with_vanishing_instance();

    let err = waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect_err("vanished instance cannot become ready");

    assert_eq!(
        err,
        ProviderError::Probe {
            name: "box".to_owned(),
            stage: ReadinessStage::Boot,
            source: Box::new(BackendError::NotFound {
                name: "box".to_owned()
            }),
        }
    );
    assert_eq!(sim.probe_count(ReadinessStage::Boot), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_daemon_is_reported_as_unavailable(name: InstanceName) {
    let sim = backend().with_unavailable_daemon();

    let err = waiter(Duration::from_secs(10))
        .wait(&sim, &name)
        .await
        .expect_err("daemon is gone");

    assert!(
        matches!(err, ProviderError::BackendUnavailable { ref backend, .. } if backend == "lxd"),
        "unexpected error: {err}"
    );
}
