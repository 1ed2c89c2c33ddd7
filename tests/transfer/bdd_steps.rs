//! BDD step definitions for file transfer.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use kiln::test_support::SimulatedBackend;
use kiln::{InstanceManager, ProviderError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{INSTANCE, TransferContext, TransferResult, manager};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn assertion(err: impl ToString) -> StepError {
    StepError::Assertion(err.to_string())
}

#[given("a host project with \"{file}\" holding \"{content}\"")]
fn host_project(
    transfer_context: TransferContext,
    file: String,
    content: String,
) -> Result<TransferContext, StepError> {
    let path = transfer_context.host_root.join("project").join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(assertion)?;
    }
    fs::write(&path, content).map_err(assertion)?;
    Ok(transfer_context)
}

#[given("the guest file \"{path}\" already holds \"{content}\"")]
fn guest_file(
    transfer_context: TransferContext,
    path: String,
    content: String,
) -> Result<TransferContext, StepError> {
    transfer_context
        .backend
        .write_guest(INSTANCE, &path, &content)
        .map_err(assertion)?;
    Ok(transfer_context)
}

#[given("extraction inside the guest fails")]
fn extraction_fails(transfer_context: TransferContext) -> TransferContext {
    TransferContext {
        backend: transfer_context.backend.with_failing_extraction(),
        ..transfer_context
    }
}

type Manager = InstanceManager<SimulatedBackend>;

/// Launches the instance, then runs `action` and records its outcome.
fn launch_and<F>(transfer_context: TransferContext, action: F) -> Result<TransferContext, StepError>
where
    F: AsyncFnOnce(&mut Manager) -> Result<(), ProviderError>,
{
    let runtime = Runtime::new().map_err(assertion)?;
    let mut managed = manager(&transfer_context.backend).map_err(StepError::Assertion)?;
    runtime.block_on(managed.launch()).map_err(assertion)?;
    let result = match runtime.block_on(action(&mut managed)) {
        Ok(()) => TransferResult::Completed,
        Err(err) => TransferResult::Failed(err.to_string()),
    };
    Ok(TransferContext {
        outcome: Some(result),
        ..transfer_context
    })
}

#[when("I push the project to \"{guest}\"")]
fn push_project(
    transfer_context: TransferContext,
    guest: String,
) -> Result<TransferContext, StepError> {
    let source = transfer_context.host_root.join("project");
    launch_and(transfer_context, async move |managed: &mut Manager| {
        managed.push(&source, Utf8Path::new(&guest)).await.map(|_| ())
    })
}

#[when("I pull \"{guest}\" into \"{host}\"")]
fn pull_output(
    transfer_context: TransferContext,
    guest: String,
    host: String,
) -> Result<TransferContext, StepError> {
    let destination: Utf8PathBuf = transfer_context.host_root.join(host);
    launch_and(transfer_context, async move |managed: &mut Manager| {
        managed
            .pull(Utf8Path::new(&guest), &destination)
            .await
            .map(|_| ())
    })
}

#[when("I push the project to \"{guest}\" and pull it back into \"{host}\"")]
fn push_and_pull_back(
    transfer_context: TransferContext,
    guest: String,
    host: String,
) -> Result<TransferContext, StepError> {
    let source = transfer_context.host_root.join("project");
    let destination = transfer_context.host_root.join(host);
    launch_and(transfer_context, async move |managed: &mut Manager| {
        let guest_path = Utf8Path::new(&guest);
        managed.push(&source, guest_path).await?;
        managed.pull(guest_path, &destination).await.map(|_| ())
    })
}

/// Relative path and content of every file below `root`, sorted.
fn tree(root: &Utf8Path) -> Result<Vec<(Utf8PathBuf, String)>, StepError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in dir.read_dir_utf8().map_err(assertion)? {
            let path = entry.map_err(assertion)?.path().to_path_buf();
            if path.is_dir() {
                pending.push(path);
            } else {
                let content = fs::read_to_string(&path).map_err(assertion)?;
                let relative = path.strip_prefix(root).map_err(assertion)?.to_path_buf();
                files.push((relative, content));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn outcome(transfer_context: &TransferContext) -> Result<&TransferResult, StepError> {
    transfer_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the transfer succeeds")]
fn transfer_succeeds(transfer_context: &TransferContext) -> Result<(), StepError> {
    match outcome(transfer_context)? {
        TransferResult::Completed => Ok(()),
        TransferResult::Failed(message) => Err(StepError::Assertion(format!(
            "transfer failed unexpectedly: {message}"
        ))),
    }
}

#[then("the transfer fails mentioning \"{text}\"")]
fn transfer_fails(transfer_context: &TransferContext, text: String) -> Result<(), StepError> {
    match outcome(transfer_context)? {
        TransferResult::Failed(message) if message.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning {text:?}, got {other:?}"
        ))),
    }
}

#[then("the guest file \"{path}\" holds \"{content}\"")]
fn guest_file_holds(
    transfer_context: &TransferContext,
    path: String,
    content: String,
) -> Result<(), StepError> {
    let actual = transfer_context.backend.read_guest(INSTANCE, &path);
    if actual.as_deref() == Some(content.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {path} to hold {content:?}, got {actual:?}"
        )))
    }
}

#[then("the guest directory \"{path}\" only contains \"{entry}\"")]
fn guest_directory_contains(
    transfer_context: &TransferContext,
    path: String,
    entry: String,
) -> Result<(), StepError> {
    let entries = transfer_context.backend.list_guest(INSTANCE, &path);
    if entries == [entry.clone()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {path} to contain only {entry}, got {entries:?}"
        )))
    }
}

#[then("the host file \"{path}\" holds \"{content}\"")]
fn host_file_holds(
    transfer_context: &TransferContext,
    path: String,
    content: String,
) -> Result<(), StepError> {
    let actual = fs::read_to_string(transfer_context.host_root.join(&path)).map_err(assertion)?;
    if actual == content {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected host {path} to hold {content:?}, got {actual:?}"
        )))
    }
}

#[then("the host directory \"{copy}\" matches the project")]
fn host_copy_matches(transfer_context: &TransferContext, copy: String) -> Result<(), StepError> {
    let original = tree(&transfer_context.host_root.join("project"))?;
    let returned = tree(&transfer_context.host_root.join(&copy))?;
    if original.len() == 3 && original == returned {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {copy} to mirror the project, got {returned:?} vs {original:?}"
        )))
    }
}
