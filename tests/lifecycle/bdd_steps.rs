//! BDD step definitions for the instance lifecycle.

use kiln::test_support::SimulatedBackend;
use kiln::{ExecutionRequest, InstanceManager, ProviderError, ReadinessStage};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Builder;

use super::test_helpers::{LifecycleContext, LifecycleOutcome, manager};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

type Manager = InstanceManager<SimulatedBackend>;

#[given("a healthy backend")]
fn healthy_backend(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("an instance named \"{name}\" already exists")]
fn existing_instance(
    lifecycle_context: LifecycleContext,
    name: String,
) -> Result<LifecycleContext, StepError> {
    let backend = lifecycle_context
        .backend
        .with_existing(&name)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    Ok(LifecycleContext {
        backend,
        ..lifecycle_context
    })
}

#[given("package downloads fail \"{count}\" times")]
fn package_downloads_fail(lifecycle_context: LifecycleContext, count: u32) -> LifecycleContext {
    LifecycleContext {
        backend: lifecycle_context.backend.with_network_failures(count),
        ..lifecycle_context
    }
}

#[given("the network never becomes ready")]
fn network_never_ready(lifecycle_context: LifecycleContext) -> LifecycleContext {
    LifecycleContext {
        backend: lifecycle_context
            .backend
            .with_never_ready(ReadinessStage::Network),
        ..lifecycle_context
    }
}

/// Drives `scenario` against a fresh manager on a paused-clock runtime and
/// records where the instance ended up.
fn drive<F>(
    lifecycle_context: LifecycleContext,
    name: &str,
    scenario: F,
) -> Result<LifecycleContext, StepError>
where
    F: AsyncFnOnce(&mut Manager) -> Result<Option<String>, ProviderError>,
{
    let runtime = Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let mut managed = manager(&lifecycle_context.backend, name).map_err(StepError::Assertion)?;
    let result = runtime.block_on(scenario(&mut managed));
    let (stdout, error) = match result {
        Ok(stdout) => (stdout, None),
        Err(err) => (None, Some(err.to_string())),
    };
    Ok(LifecycleContext {
        outcome: Some(LifecycleOutcome {
            state: managed.state(),
            stdout,
            error,
        }),
        ..lifecycle_context
    })
}

#[when("I launch \"{name}\" and run \"{command}\"")]
fn launch_and_run(
    lifecycle_context: LifecycleContext,
    name: String,
    command: String,
) -> Result<LifecycleContext, StepError> {
    drive(lifecycle_context, &name, async move |managed: &mut Manager| {
        managed.launch().await?;
        let request = ExecutionRequest::new(command.split_whitespace());
        let result = managed.execute_checked(&request).await?;
        Ok(Some(result.stdout))
    })
}

#[when("I launch \"{name}\", run \"{command}\" and delete it")]
fn launch_run_and_delete(
    lifecycle_context: LifecycleContext,
    name: String,
    command: String,
) -> Result<LifecycleContext, StepError> {
    drive(lifecycle_context, &name, async move |managed: &mut Manager| {
        managed.launch().await?;
        let request = ExecutionRequest::new(command.split_whitespace());
        let result = managed.execute(&request).await?;
        managed.delete().await?;
        Ok(Some(result.stdout))
    })
}

#[when("I launch \"{name}\" and then delete it")]
fn launch_then_delete(
    lifecycle_context: LifecycleContext,
    name: String,
) -> Result<LifecycleContext, StepError> {
    drive(lifecycle_context, &name, async |managed: &mut Manager| {
        let launched = managed.launch().await.map(|_| None);
        managed.delete().await?;
        launched
    })
}

#[when("I launch \"{name}\" and then delete it twice")]
fn launch_then_delete_twice(
    lifecycle_context: LifecycleContext,
    name: String,
) -> Result<LifecycleContext, StepError> {
    drive(lifecycle_context, &name, async |managed: &mut Manager| {
        managed.launch().await?;
        managed.delete().await?;
        managed.delete().await?;
        Ok(None)
    })
}

#[when("I launch \"{name}\" and restart it")]
fn launch_and_restart(
    lifecycle_context: LifecycleContext,
    name: String,
) -> Result<LifecycleContext, StepError> {
    drive(lifecycle_context, &name, async |managed: &mut Manager| {
        managed.launch().await?;
        managed.restart().await?;
        Ok(None)
    })
}

fn outcome(lifecycle_context: &LifecycleContext) -> Result<&LifecycleOutcome, StepError> {
    lifecycle_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the instance state is \"{state}\"")]
fn instance_state(lifecycle_context: &LifecycleContext, state: String) -> Result<(), StepError> {
    let actual = outcome(lifecycle_context)?.state.to_string();
    if actual == state {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected state {state}, got {actual}"
        )))
    }
}

#[then("the command output is \"{text}\"")]
fn command_output(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    match &outcome(lifecycle_context)?.stdout {
        Some(stdout) if stdout.trim_end() == text => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected output {text:?}, got {other:?}"
        ))),
    }
}

#[then("the operation fails mentioning \"{text}\"")]
fn operation_fails(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    match &outcome(lifecycle_context)?.error {
        Some(message) if message.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an error mentioning {text:?}, got {other:?}"
        ))),
    }
}

#[then("the package manager ran \"{count}\" times")]
fn package_manager_runs(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let actual = lifecycle_context.backend.install_runs();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} package manager runs, got {actual}"
        )))
    }
}

#[then("the backend no longer knows \"{name}\"")]
fn backend_forgot(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    if lifecycle_context.backend.exists(&name) {
        Err(StepError::Assertion(format!("{name} still exists")))
    } else {
        Ok(())
    }
}

#[then("the backend deleted \"{count}\" instance")]
fn backend_deletes(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let actual = lifecycle_context.backend.deletes();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} backend deletes, got {actual}"
        )))
    }
}
