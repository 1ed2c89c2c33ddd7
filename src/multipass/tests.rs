//! Unit tests for the Multipass adapter.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::backend::Resources;
use crate::test_support::ScriptedRunner;

const MISSING: &str = "info failed: instance \"box\" does not exist";

struct Harness {
    runner: ScriptedRunner,
    backend: MultipassBackend<ScriptedRunner>,
    name: InstanceName,
}

#[fixture]
fn harness() -> Harness {
    let runner = ScriptedRunner::new();
    let settings = MultipassSettings {
        host_ids: Some((1000, 1001)),
        ..MultipassSettings::default()
    };
    Harness {
        backend: MultipassBackend::with_runner(settings, runner.clone()),
        runner,
        name: InstanceName::parse("box").expect("valid name"),
    }
}

fn info(state: &str, ipv4: &[&str]) -> String {
    serde_json::json!({
        "errors": [],
        "info": {
            "box": {
                "state": state,
                "ipv4": ipv4,
                "release": "Ubuntu 22.04.4 LTS",
                "mounts": {
                    "/work": { "source_path": "/home/me/work" }
                }
            }
        }
    })
    .to_string()
}

#[rstest]
#[tokio::test]
async fn launches_with_requested_resources(harness: Harness) {
    harness.runner.push_failure(1, MISSING);
    harness.runner.push_success();
    let resources = Resources {
        cpus: 4,
        memory_gb: 8,
        disk_gb: 40,
        network: NetworkMode::Attached("en0".to_owned()),
    };
    let request = LaunchRequest::builder(harness.name.clone(), Base::ubuntu("22.04"))
        .resources(resources)
        .build()
        .expect("valid launch request");

    harness.backend.launch(&request).await.expect("launch should succeed");

    assert_eq!(
        harness.runner.command_strings(),
        [
            "multipass info box --format json",
            "multipass launch 22.04 --name box --cpus 4 --memory 8G --disk 40G --network name=en0",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn only_ubuntu_bases_are_launched(harness: Harness) {
    let request = LaunchRequest::builder(harness.name.clone(), Base::new("fedora", "40"))
        .build()
        .expect("valid launch request");

    let err = harness
        .backend
        .launch(&request)
        .await
        .expect_err("no fedora images");

    assert!(matches!(err, BackendError::Validation(ref message) if message.contains("fedora:40")));
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn refuses_to_launch_over_an_existing_instance(harness: Harness) {
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));

    let err = harness
        .backend
        .launch(
            &LaunchRequest::builder(harness.name.clone(), Base::ubuntu("22.04"))
                .build()
                .expect("valid launch request"),
        )
        .await
        .expect_err("name in use");

    assert!(matches!(err, BackendError::AlreadyExists { .. }));
}

#[rstest]
#[tokio::test]
async fn missing_instances_have_no_status(harness: Harness) {
    harness.runner.push_failure(1, MISSING);

    let status = harness.backend.status(&harness.name).await.expect("info");

    assert_eq!(status, None);
}

#[rstest]
#[tokio::test]
async fn status_reports_addresses(harness: Harness) {
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));

    let status = harness
        .backend
        .status(&harness.name)
        .await
        .expect("info")
        .expect("instance exists");

    assert_eq!(status.state, RunState::Running);
    assert_eq!(status.addresses, ["10.1.2.3"]);
}

#[rstest]
#[case(info("Running", &["10.1.2.3"]), ReadyState::Ready)]
#[case(info("Running", &[]), ReadyState::not_ready("no IPv4 address assigned"))]
#[case(info("Starting", &[]), ReadyState::not_ready("state is starting"))]
#[tokio::test]
async fn boot_requires_an_address(
    harness: Harness,
    #[case] document: String,
    #[case] expected: ReadyState,
) {
    harness.runner.push_stdout(document);

    let state = harness
        .backend
        .probe_ready(&harness.name, ReadinessStage::Boot)
        .await
        .expect("probe");

    assert_eq!(state, expected);
}

#[rstest]
#[tokio::test]
async fn executes_as_root_with_working_directory(harness: Harness) {
    harness.runner.push_output(Some(1), "", "make: *** no rule");
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));
    let exec = ExecutionRequest::new(["make"]).cwd("/work").env("JOBS", "4");

    let output = harness.backend.execute(&harness.name, &exec).await.expect("exec");

    assert_eq!(output.code, Some(1));
    assert_eq!(
        harness.runner.command_strings(),
        [
            "multipass exec box --working-directory /work -- sudo -H -- env JOBS=4 make",
            "multipass info box --format json",
        ]
    );
    assert_eq!(
        harness
            .runner
            .invocations()
            .into_iter()
            .next()
            .and_then(|call| call.timeout),
        None
    );
}

#[rstest]
#[tokio::test]
async fn exec_against_a_stopped_daemon_is_unavailable(harness: Harness) {
    harness
        .runner
        .push_failure(2, "cannot connect to the multipass socket");
    harness
        .runner
        .push_failure(2, "cannot connect to the multipass socket");

    let err = harness
        .backend
        .execute(&harness.name, &ExecutionRequest::new(["true"]))
        .await
        .expect_err("daemon is down");

    assert!(matches!(err, BackendError::Unavailable { .. }), "{err}");
}

#[rstest]
#[case(7, "curl: (7) Failed to connect: Connection refused")]
#[case(1, "cat: /etc/kiln.conf: file does not exist")]
#[tokio::test]
async fn guest_failures_keep_their_exit_code(
    harness: Harness,
    #[case] code: i32,
    #[case] stderr: &str,
) {
    harness.runner.push_failure(code, stderr);
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));

    let output = harness
        .backend
        .execute(&harness.name, &ExecutionRequest::new(["curl", "https://mirror"]))
        .await
        .expect("guest failure is not a backend failure");

    assert_eq!(output.code, Some(code));
}

#[rstest]
#[tokio::test]
async fn exec_against_a_deleted_instance_is_not_found(harness: Harness) {
    harness.runner.push_failure(2, MISSING);
    harness.runner.push_failure(2, MISSING);

    let err = harness
        .backend
        .execute(&harness.name, &ExecutionRequest::new(["true"]))
        .await
        .expect_err("instance is gone");

    assert!(matches!(err, BackendError::NotFound { .. }), "{err}");
}

#[rstest]
#[tokio::test]
async fn transfers_use_instance_prefixed_guest_paths(harness: Harness) {
    harness.runner.push_success();
    let transfer = FileTransfer {
        host_path: Utf8PathBuf::from("/tmp/out.tar"),
        guest_path: Utf8PathBuf::from("/tmp/kiln-1.tar"),
        direction: TransferDirection::Pull,
    };

    harness
        .backend
        .transfer(&harness.name, &transfer)
        .await
        .expect("pull");

    assert_eq!(
        harness.runner.command_strings(),
        ["multipass transfer box:/tmp/kiln-1.tar /tmp/out.tar"]
    );
}

#[rstest]
#[tokio::test]
async fn mounts_map_host_ids_to_root(harness: Harness) {
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));
    harness.runner.push_success();
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));
    let fresh = MountSpec {
        host_source: Utf8PathBuf::from("/home/me/cache"),
        guest_target: Utf8PathBuf::from("/cache"),
    };
    let existing = MountSpec {
        host_source: Utf8PathBuf::from("/home/me/work"),
        guest_target: Utf8PathBuf::from("/work"),
    };

    harness.backend.mount(&harness.name, &fresh).await.expect("mount");
    harness.backend.mount(&harness.name, &existing).await.expect("already mounted");

    let commands = harness.runner.command_strings();
    assert_eq!(
        commands.get(1).map(String::as_str),
        Some("multipass mount /home/me/cache box:/cache --uid-map 1000:0 --gid-map 1001:0")
    );
    assert_eq!(commands.len(), 3);
}

#[rstest]
#[tokio::test]
async fn teardown_is_idempotent(harness: Harness) {
    harness.runner.push_stdout(info("Running", &["10.1.2.3"]));
    harness.runner.push_success();
    harness.runner.push_stdout(info("Stopped", &[]));
    harness.runner.push_stdout(info("Stopped", &[]));
    harness.runner.push_success();
    harness.runner.push_failure(1, MISSING);

    harness.backend.stop(&harness.name).await.expect("stop");
    harness.backend.stop(&harness.name).await.expect("already stopped");
    harness.backend.delete(&harness.name).await.expect("delete");
    harness.backend.delete(&harness.name).await.expect("already gone");

    assert_eq!(
        harness.runner.command_strings(),
        [
            "multipass info box --format json",
            "multipass stop box",
            "multipass info box --format json",
            "multipass info box --format json",
            "multipass delete box --purge",
            "multipass info box --format json",
        ]
    );
}
