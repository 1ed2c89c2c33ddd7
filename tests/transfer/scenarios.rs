use super::test_helpers::{TransferContext, transfer_context};
use rstest_bdd_macros::scenario;

#[scenario(
    path = "tests/features/transfer.feature",
    name = "Push a project tree into the instance"
)]
fn scenario_push_tree(transfer_context: TransferContext) {
    let _ = transfer_context;
}

#[scenario(
    path = "tests/features/transfer.feature",
    name = "A failed extraction keeps the previous tree"
)]
fn scenario_failed_extraction(transfer_context: TransferContext) {
    let _ = transfer_context;
}

#[scenario(
    path = "tests/features/transfer.feature",
    name = "Pull build output back to the host"
)]
fn scenario_pull_output(transfer_context: TransferContext) {
    let _ = transfer_context;
}

#[scenario(
    path = "tests/features/transfer.feature",
    name = "A pushed tree comes back unchanged"
)]
fn scenario_round_trip(transfer_context: TransferContext) {
    let _ = transfer_context;
}
