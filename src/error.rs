//! Error taxonomy surfaced to callers of the provider.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::{BackendError, ReadinessStage, ReadyState, TransferDirection};
use crate::instance::InstanceState;

/// Errors raised by the instance provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the host virtualisation service is missing or its daemon
    /// cannot be reached.
    #[error("{backend} is unavailable: {message}")]
    BackendUnavailable {
        /// Backend identifier.
        backend: String,
        /// Reason reported by the host.
        message: String,
    },
    /// Raised when an instance cannot be created.
    #[error("failed to launch instance {name}: {reason}")]
    Launch {
        /// Instance name.
        name: String,
        /// Failure description.
        reason: String,
    },
    /// Raised when an instance fails to become usable before the readiness
    /// deadline.
    #[error(
        "instance {name} was not ready after {}s: {stage} stage {last_state}",
        .waited.as_secs()
    )]
    ReadinessTimeout {
        /// Instance name.
        name: String,
        /// Stage that was still unsatisfied.
        stage: ReadinessStage,
        /// Last observation of that stage.
        last_state: ReadyState,
        /// Total time spent waiting.
        waited: Duration,
    },
    /// Raised when a readiness probe fails in a way retrying cannot fix.
    #[error("readiness probe for {name} failed at {stage} stage: {source}")]
    Probe {
        /// Instance name.
        name: String,
        /// Stage being probed.
        stage: ReadinessStage,
        /// Backend failure.
        source: Box<BackendError>,
    },
    /// Raised when the guest is not the operating system the base expects.
    #[error("instance {name} is incompatible with its base: {reason}")]
    BaseValidation {
        /// Instance name.
        name: String,
        /// Mismatch description.
        reason: String,
    },
    /// Raised when installing prerequisites fails.
    #[error("failed to {step} on {name} after {attempts} attempt(s)\n{details}")]
    BaseInstallation {
        /// Instance name.
        name: String,
        /// Step that failed.
        step: String,
        /// Attempts made, including the last.
        attempts: u32,
        /// Diagnostic detail from the last attempt.
        details: String,
    },
    /// Raised when a command cannot be run or does not report an exit
    /// status.
    #[error("failed to execute {command} on {name}: {message}")]
    Execution {
        /// Instance name.
        name: String,
        /// Rendered command line.
        command: String,
        /// Failure description.
        message: String,
    },
    /// Raised when a command outlives its deadline.
    #[error("{command} on {name} did not finish within {}s", .timeout.as_secs())]
    ExecutionTimeout {
        /// Instance name.
        name: String,
        /// Rendered command line.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Raised when a push or pull fails. A failed transfer leaves no partial
    /// destination behind.
    #[error("failed to {direction} {host_path} <-> {name}:{guest_path}: {message}")]
    Transfer {
        /// Instance name.
        name: String,
        /// Copy direction.
        direction: TransferDirection,
        /// Host path.
        host_path: Utf8PathBuf,
        /// Guest path.
        guest_path: Utf8PathBuf,
        /// Failure description.
        message: String,
    },
    /// Raised when a snap cannot be installed into the instance.
    #[error("failed to install snap {snap} on {name}: {details}")]
    SnapInstallation {
        /// Instance name.
        name: String,
        /// Snap being installed.
        snap: String,
        /// Diagnostic detail from the failed step.
        details: String,
    },
    /// Raised when stopping or deleting an instance fails.
    #[error("failed to {operation} instance {name}: {message}")]
    Teardown {
        /// Instance name.
        name: String,
        /// Operation attempted.
        operation: String,
        /// Failure description.
        message: String,
    },
    /// Raised when an operation is requested from a state that does not
    /// allow it.
    #[error("cannot {operation} instance {name} while it is {state}")]
    InvalidTransition {
        /// Instance name.
        name: String,
        /// Current state.
        state: InstanceState,
        /// Operation requested.
        operation: String,
    },
    /// Raised when configuration cannot be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Returns `true` when the instance is still usable after this error.
    ///
    /// Command, transfer and snap installation failures leave a READY
    /// instance intact; launch, readiness and configuration failures do not.
    #[must_use]
    pub const fn instance_usable(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. }
                | Self::ExecutionTimeout { .. }
                | Self::Transfer { .. }
                | Self::SnapInstallation { .. }
        )
    }

    /// Lifts an adapter error into the category `fallback` builds, keeping
    /// unavailability distinct.
    pub(crate) fn from_backend(
        backend: impl Into<String>,
        err: BackendError,
        fallback: impl FnOnce(String) -> Self,
    ) -> Self {
        match err {
            BackendError::Unavailable { program, message } => Self::BackendUnavailable {
                backend: backend.into(),
                message: format!("{program}: {message}"),
            },
            other => fallback(other.to_string()),
        }
    }
}
