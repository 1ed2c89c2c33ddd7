//! Guest-side readiness checks shared by every adapter.

use super::{ExecutionRequest, ReadyState};
use crate::process::CommandOutput;

/// Command that succeeds once the guest can resolve `host`.
pub(crate) fn network_request(host: &str) -> ExecutionRequest {
    ExecutionRequest::new(["getent", "hosts", host])
}

/// Command reporting the overall systemd state.
pub(crate) fn init_system_request() -> ExecutionRequest {
    ExecutionRequest::new(["systemctl", "is-system-running"])
}

pub(crate) fn interpret_network(host: &str, output: &CommandOutput) -> ReadyState {
    if output.is_success() && !output.stdout.trim().is_empty() {
        ReadyState::Ready
    } else {
        ReadyState::not_ready(format!("cannot resolve {host}"))
    }
}

/// `degraded` counts as ready: a failed optional unit does not stop builds.
pub(crate) fn interpret_init_system(output: &CommandOutput) -> ReadyState {
    match output.stdout.trim() {
        "running" | "degraded" => ReadyState::Ready,
        "" => ReadyState::not_ready("init system state unavailable"),
        other => ReadyState::not_ready(format!("init system is {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn output(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }
    }

    #[rstest]
    #[case(output(0, "running\n"), ReadyState::Ready)]
    #[case(output(1, "degraded\n"), ReadyState::Ready)]
    #[case(output(1, "starting\n"), ReadyState::not_ready("init system is starting"))]
    #[case(output(1, ""), ReadyState::not_ready("init system state unavailable"))]
    fn init_system_states(#[case] observed: CommandOutput, #[case] expected: ReadyState) {
        assert_eq!(interpret_init_system(&observed), expected);
    }

    #[rstest]
    fn network_requires_a_resolved_address() {
        let ready = interpret_network("example.org", &output(0, "93.184.216.34 example.org\n"));
        let pending = interpret_network("example.org", &output(2, ""));

        assert_eq!(ready, ReadyState::Ready);
        assert_eq!(pending, ReadyState::not_ready("cannot resolve example.org"));
    }
}
