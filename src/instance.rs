//! Instance records and the lifecycle state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backend::{BackendKind, InstanceName};
use crate::base::Base;
use crate::error::ProviderError;

/// Lifecycle states of a managed instance.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstanceState {
    /// Nothing has been created yet.
    NotCreated,
    /// The backend is creating the instance.
    Launching,
    /// Waiting for the readiness probes to pass.
    WaitingReady,
    /// Validating and preparing the base.
    ConfiguringBase,
    /// Usable for commands and transfers.
    Ready,
    /// A command or transfer is in progress.
    Executing,
    /// The backend is stopping the instance.
    Stopping,
    /// Shut down but still present.
    Stopped,
    /// The backend is removing the instance.
    Deleting,
    /// Removed; terminal.
    Deleted,
    /// Launch, readiness or configuration failed. Only teardown is allowed.
    Failed,
}

impl InstanceState {
    /// Returns `true` when the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use InstanceState::{
            ConfiguringBase, Deleted, Deleting, Executing, Failed, Launching, NotCreated, Ready,
            Stopped, Stopping, WaitingReady,
        };
        matches!(
            (self, next),
            (NotCreated, Launching)
                | (Launching | WaitingReady | ConfiguringBase, Failed)
                | (Launching, WaitingReady)
                | (WaitingReady, ConfiguringBase | Ready)
                | (ConfiguringBase | Executing, Ready)
                | (Ready, Executing)
                | (Ready | Failed | Stopping | Deleting, Stopping)
                | (Stopping, Stopped)
                | (Stopped, WaitingReady)
                | (NotCreated | Ready | Stopping | Stopped | Failed | Deleting, Deleting)
                | (Deleting, Deleted)
        )
    }

    /// Returns `true` once the instance has been removed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotCreated => "not created",
            Self::Launching => "launching",
            Self::WaitingReady => "waiting for readiness",
            Self::ConfiguringBase => "configuring its base",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        })
    }
}

/// Instance tracked by the lifecycle manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Unique name.
    pub name: InstanceName,
    /// Service hosting the instance.
    pub backend: BackendKind,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Base the instance was launched from.
    pub base: Base,
}

impl Instance {
    /// Creates a record in [`InstanceState::NotCreated`].
    #[must_use]
    pub fn new(name: InstanceName, backend: BackendKind, base: Base) -> Self {
        Self {
            name,
            backend,
            state: InstanceState::NotCreated,
            created_at: Utc::now(),
            base,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidTransition`] naming `operation` when
    /// the move is not allowed.
    pub fn transition(
        &mut self,
        next: InstanceState,
        operation: &str,
    ) -> Result<(), ProviderError> {
        if !self.state.can_transition_to(next) {
            return Err(self.invalid(operation));
        }
        debug!(instance = %self.name, from = %self.state, to = %next, "instance state change");
        self.state = next;
        Ok(())
    }

    /// Builds the error for `operation` attempted in the current state.
    #[must_use]
    pub fn invalid(&self, operation: &str) -> ProviderError {
        ProviderError::InvalidTransition {
            name: self.name.to_string(),
            state: self.state,
            operation: operation.to_owned(),
        }
    }
}
