//! Backend abstraction over the virtualisation services that host build
//! instances.
//!
//! A [`Backend`] wraps one host service (an LXD daemon or a Multipass
//! daemon) behind a uniform contract. Adapters are stateless with respect to
//! instance identity: every call names the instance it targets, and the
//! lifecycle manager is the only component that remembers what exists.

mod error;
mod model;
mod name;
pub(crate) mod probe;

use std::future::Future;
use std::pin::Pin;

pub use error::{BackendError, CommandDetails, render_command};
pub use model::{
    BackendKind, ExecutionRequest, ExecutionResult, FileTransfer, InstanceStatus, LaunchRequest,
    LaunchRequestBuilder, MountSpec, NetworkMode, ReadinessStage, ReadyState, Resources,
    RunState, TransferDirection, TransferKind, TransferRequest,
};
pub use name::{InstanceName, InstanceNameError};

use crate::process::CommandOutput;

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E = BackendError> =
    Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Uniform contract implemented by every host virtualisation service.
///
/// `stop` and `delete` must be idempotent: calling them against an instance
/// that is already stopped or absent succeeds without side effects.
pub trait Backend: Send + Sync {
    /// Identifies the service behind this adapter.
    fn kind(&self) -> BackendKind;

    /// Creates and boots a new instance from the request's base image.
    ///
    /// Returns [`BackendError::AlreadyExists`] when the name is taken.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, ()>;

    /// Reports the current status of `name`, or `None` when it does not
    /// exist.
    fn status<'a>(&'a self, name: &'a InstanceName)
    -> BackendFuture<'a, Option<InstanceStatus>>;

    /// Performs one non-blocking readiness probe for `stage`.
    fn probe_ready<'a>(
        &'a self,
        name: &'a InstanceName,
        stage: ReadinessStage,
    ) -> BackendFuture<'a, ReadyState>;

    /// Runs a command inside the instance and returns its raw output.
    ///
    /// A non-zero guest exit status is reported through the output, not as
    /// an error.
    fn execute<'a>(
        &'a self,
        name: &'a InstanceName,
        request: &'a ExecutionRequest,
    ) -> BackendFuture<'a, CommandOutput>;

    /// Copies one regular file between the host and the instance.
    fn transfer<'a>(
        &'a self,
        name: &'a InstanceName,
        transfer: &'a FileTransfer,
    ) -> BackendFuture<'a, ()>;

    /// Shares a host directory into the instance. Mounting the same target
    /// twice is a no-op.
    fn mount<'a>(&'a self, name: &'a InstanceName, spec: &'a MountSpec) -> BackendFuture<'a, ()>;

    /// Boots a stopped instance.
    fn start<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()>;

    /// Stops a running instance.
    fn stop<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()>;

    /// Removes the instance and everything the service allocated for it.
    fn delete<'a>(&'a self, name: &'a InstanceName) -> BackendFuture<'a, ()>;
}

/// Treats a missing instance as success, for idempotent teardown.
pub(crate) fn ignore_missing(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(BackendError::NotFound { .. }) => Ok(()),
        other => other,
    }
}
