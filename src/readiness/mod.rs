//! Waiting for a freshly booted instance to become usable.
//!
//! Stages are polled in order and share one overall deadline. A stage may
//! use whatever the earlier stages left, so a slow boot only shortens the
//! time left for the network and init system stages.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{Backend, BackendError, InstanceName, ReadinessStage, ReadyState};
use crate::error::ProviderError;
use crate::retry::{Backoff, RetryPolicy};

/// Polls backend readiness probes until every stage passes.
#[derive(Clone, Debug)]
pub struct ReadinessWaiter {
    policy: RetryPolicy,
}

impl ReadinessWaiter {
    /// Creates a waiter whose overall deadline is `policy.timeout()`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Blocks until `name` passes every readiness stage.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ReadinessTimeout`] naming the unsatisfied
    /// stage once the deadline passes, [`ProviderError::Probe`] when a probe
    /// fails permanently, and [`ProviderError::BackendUnavailable`] when the
    /// service disappears.
    pub async fn wait<B>(&self, backend: &B, name: &InstanceName) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout();
        for stage in ReadinessStage::ALL {
            self.wait_stage(backend, name, stage, started, deadline).await?;
        }
        info!(
            instance = %name,
            waited_ms = started.elapsed().as_millis(),
            "instance ready"
        );
        Ok(())
    }

    async fn wait_stage<B>(
        &self,
        backend: &B,
        name: &InstanceName,
        stage: ReadinessStage,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), ProviderError>
    where
        B: Backend + ?Sized,
    {
        let mut retry = self.policy.start().bounded_by(deadline);
        loop {
            let observed =
                match tokio::time::timeout_at(deadline, backend.probe_ready(name, stage))
                    .await
                {
                    Ok(Ok(state)) => state,
                    Ok(Err(err)) if err.is_transient() => ReadyState::not_ready(err.to_string()),
                    Ok(Err(err)) => return Err(probe_failure(backend, name, stage, err)),
                    Err(_) => ReadyState::not_ready("probe did not answer"),
                };
            if observed == ReadyState::Ready {
                debug!(instance = %name, %stage, attempts = retry.attempt() + 1, "stage ready");
                return Ok(());
            }
            debug!(instance = %name, %stage, state = %observed, "stage not ready");
            match retry.next_at(Instant::now()) {
                Backoff::Wait(delay) => tokio::time::sleep(delay).await,
                Backoff::Exhausted => {
                    return Err(ProviderError::ReadinessTimeout {
                        name: name.to_string(),
                        stage,
                        last_state: observed,
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }
}

fn probe_failure<B>(
    backend: &B,
    name: &InstanceName,
    stage: ReadinessStage,
    err: BackendError,
) -> ProviderError
where
    B: Backend + ?Sized,
{
    if let BackendError::Unavailable { program, message } = err {
        return ProviderError::BackendUnavailable {
            backend: backend.kind().to_string(),
            message: format!("{program}: {message}"),
        };
    }
    ProviderError::Probe {
        name: name.to_string(),
        stage,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests;
