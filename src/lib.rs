//! Core library for kiln, a provider of ephemeral build environments.
//!
//! kiln launches LXD system containers or Multipass virtual machines, waits
//! until they are usable, prepares their base image once, and then runs
//! commands and moves files in and out of them. Every instance is owned by an
//! [`InstanceManager`] which enforces the lifecycle
//! (launch → readiness → base configuration → use → stop/delete).

pub mod backend;
pub mod base;
pub mod config;
pub mod configure;
pub mod error;
pub mod executor;
pub mod instance;
pub mod lifecycle;
pub mod lxd;
pub mod multipass;
pub mod process;
pub mod provider;
pub mod readiness;
pub mod retry;
pub mod test_support;

pub use backend::{
    Backend, BackendError, BackendKind, ExecutionRequest, ExecutionResult, InstanceName,
    LaunchRequest, MountSpec, NetworkMode, ReadinessStage, ReadyState, Resources, TransferDirection,
    TransferKind, TransferRequest,
};
pub use base::{Base, BaseError, COMPATIBILITY_FILE, CompatibilityRecord};
pub use config::{ConfigError, ProviderConfig, Timeouts};
pub use configure::{BaseConfigurer, ConfigureState};
pub use error::ProviderError;
pub use executor::{Executor, SnapSource};
pub use instance::{Instance, InstanceState};
pub use lifecycle::{InstanceManager, ManagerSettings};
pub use lxd::{LxdBackend, LxdSettings};
pub use multipass::{MultipassBackend, MultipassSettings};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use provider::AnyBackend;
pub use readiness::ReadinessWaiter;
pub use retry::{RetryContext, RetryPolicy};
