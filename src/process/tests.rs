//! Unit tests for the host process runner.

use super::*;
use rstest::rstest;

fn run(spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(ProcessCommandRunner.run(spec))
}

#[rstest]
fn captures_exit_code_and_streams() {
    let spec = CommandSpec::new("sh", ["-c", "echo out; echo err >&2; exit 3"]);

    let output = run(&spec).expect("command should run");

    assert_eq!(output.code, Some(3));
    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
    assert!(!output.is_success());
}

#[rstest]
fn forwards_standard_input() {
    let spec = CommandSpec::new("cat", Vec::<String>::new()).with_stdin(Some(b"payload".to_vec()));

    let output = run(&spec).expect("command should run");

    assert_eq!(output.stdout, "payload");
}

#[rstest]
fn kills_commands_that_outlive_their_timeout() {
    let spec = CommandSpec::new("sleep", ["5"]).with_timeout(Some(Duration::from_millis(100)));

    let err = run(&spec).expect_err("sleep should be killed");

    assert!(matches!(err, RunnerError::TimedOut { .. }));
}

#[rstest]
fn missing_programs_map_to_unavailable_backends() {
    let spec = CommandSpec::new("kiln-definitely-missing-binary", ["--version"]);

    let err = run(&spec).expect_err("spawn should fail");

    assert!(matches!(
        BackendError::from(err),
        BackendError::Unavailable { program, .. } if program == "kiln-definitely-missing-binary"
    ));
}

#[rstest]
fn renders_quoted_command_lines() {
    let spec = CommandSpec::new("lxc", ["exec", "box", "--", "echo", "a b"]);

    assert_eq!(spec.render(), "lxc exec box -- echo 'a b'");
}
