use super::test_helpers::{LifecycleContext, lifecycle_context};
use rstest_bdd_macros::scenario;

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Launch an instance and run a command"
)]
fn scenario_launch_and_run(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Run a command and delete the instance"
)]
fn scenario_run_and_delete(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Refuse to launch over an existing instance"
)]
fn scenario_refuse_existing(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Retry transient package download failures"
)]
fn scenario_retry_downloads(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failed launch can still be deleted"
)]
fn scenario_delete_after_failure(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(path = "tests/features/lifecycle.feature", name = "Teardown is idempotent")]
fn scenario_idempotent_teardown(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Restarting keeps the configured base"
)]
fn scenario_restart(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
