//! Shared fixtures for transfer BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use kiln::test_support::SimulatedBackend;
use kiln::{Base, InstanceManager, InstanceName, ManagerSettings, RetryPolicy};
use rstest::fixture;
use tempfile::TempDir;

pub const INSTANCE: &str = "builder";

#[derive(Clone, Debug)]
pub struct TransferContext {
    pub backend: SimulatedBackend,
    pub host_root: Utf8PathBuf,
    pub outcome: Option<TransferResult>,
    pub(crate) host_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum TransferResult {
    Completed,
    Failed(String),
}

#[fixture]
pub fn transfer_context() -> TransferContext {
    let backend = SimulatedBackend::new()
        .unwrap_or_else(|err| panic!("simulated backend should initialise: {err}"));
    let host_tmp =
        TempDir::new().unwrap_or_else(|err| panic!("host tempdir should initialise: {err}"));
    let host_root = Utf8PathBuf::from_path_buf(host_tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir path: {}", path.display()));
    TransferContext {
        backend,
        host_root,
        outcome: None,
        host_tmp: Arc::new(host_tmp),
    }
}

pub fn manager(backend: &SimulatedBackend) -> Result<InstanceManager<SimulatedBackend>, String> {
    let name = InstanceName::parse(INSTANCE).map_err(|err| err.to_string())?;
    let defaults = ManagerSettings::default();
    let policy = RetryPolicy::new(
        Duration::from_millis(10),
        Duration::from_millis(50),
        defaults.timeouts.readiness,
    );
    let settings = ManagerSettings {
        readiness_policy: policy.clone(),
        install_policy: policy,
        ..defaults
    };
    Ok(InstanceManager::new(
        backend.clone(),
        name,
        Base::ubuntu("22.04"),
        settings,
    ))
}
