//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn help_lists_the_run_command() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("run"));
}

#[test]
fn run_without_a_command_is_a_usage_error() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.arg("run").assert().code(2).stderr(contains("<COMMAND>"));
}

#[test]
fn unknown_backend_is_reported_before_launching() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.env("KILN_BACKEND", "qemu")
        .args(["run", "--", "true"])
        .assert()
        .code(1)
        .stderr(contains("KILN_BACKEND"));
}
