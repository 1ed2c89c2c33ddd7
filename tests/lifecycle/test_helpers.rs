//! Shared fixtures for lifecycle BDD scenarios.

use std::time::Duration;

use kiln::test_support::SimulatedBackend;
use kiln::{
    Base, InstanceManager, InstanceName, InstanceState, ManagerSettings, Resources, RetryPolicy,
    Timeouts,
};
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub backend: SimulatedBackend,
    pub outcome: Option<LifecycleOutcome>,
}

#[derive(Clone, Debug)]
pub struct LifecycleOutcome {
    pub state: InstanceState,
    pub stdout: Option<String>,
    pub error: Option<String>,
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    let backend = SimulatedBackend::new()
        .unwrap_or_else(|err| panic!("simulated backend should initialise: {err}"));
    LifecycleContext {
        backend,
        outcome: None,
    }
}

pub fn fast_settings() -> ManagerSettings {
    let timeouts = Timeouts {
        launch: Duration::from_secs(30),
        readiness: Duration::from_secs(5),
        ..Timeouts::default()
    };
    let policy = |timeout| {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), timeout)
            .with_jitter_percent(0)
    };
    ManagerSettings {
        timeouts,
        resources: Resources::default(),
        readiness_policy: policy(timeouts.readiness),
        install_policy: policy(timeouts.launch),
        install_attempts: 3,
    }
}

pub fn manager(
    backend: &SimulatedBackend,
    name: &str,
) -> Result<InstanceManager<SimulatedBackend>, String> {
    let instance_name = InstanceName::parse(name).map_err(|err| err.to_string())?;
    Ok(InstanceManager::new(
        backend.clone(),
        instance_name,
        Base::ubuntu("22.04"),
        fast_settings(),
    ))
}
