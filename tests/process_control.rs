//! Controller behavior against real child processes. Unix-only: the
//! fixtures are shell scripts and the signals are POSIX.
#![cfg(unix)]

mod common;

use common::{free_port, null_probe};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use svcwatch_agent::control::{ProcessController, StartOptions, StopOptions};
use svcwatch_agent::types::{ServiceKind, ServiceState, Target};

/// Writes an executable shell script into `dir` and returns a target whose
/// exe points at it.
fn script_target(dir: &tempfile::TempDir, body: &str, port: Option<u16>) -> Target {
    let path: PathBuf = dir.path().join("svc.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    Target {
        id: "svc".into(),
        name: "svc".into(),
        display_name: "Service svc".into(),
        kind: ServiceKind::Appserver,
        enabled: true,
        port,
        ini_path: dir.path().join("svc.ini"),
        exe_path: path,
        working_dir: Some(dir.path().to_path_buf()),
    }
}

#[tokio::test]
async fn stopping_a_stopped_target_succeeds_without_signaling() {
    let controller = ProcessController::new(null_probe());
    let target = common::target("svc", Some(free_port()));

    let result = controller.stop(&target, StopOptions::default()).await;
    assert!(result.success);
    assert_eq!(result.previous_status, Some(ServiceState::Stopped));
    assert_eq!(result.current_status, Some(ServiceState::Stopped));
    assert_eq!(result.pid, None);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn stop_fails_when_the_pid_cannot_be_resolved() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = ProcessController::new(null_probe());
    let target = common::target("svc", Some(port));

    let result = controller.stop(&target, StopOptions::default()).await;
    assert!(!result.success);
    assert_eq!(result.previous_status, Some(ServiceState::Running));
    assert!(result.error.as_deref().unwrap().contains("pid"));
    drop(listener);
}

#[tokio::test]
async fn start_refuses_a_target_that_is_already_listening() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = ProcessController::new(null_probe());
    let target = common::target("svc", Some(port));

    let result = controller.start(&target, StartOptions::default()).await;
    assert!(!result.success);
    assert_eq!(result.current_status, Some(ServiceState::Running));
    assert_eq!(result.error.as_deref(), Some("service is already running"));
    drop(listener);
}

#[tokio::test]
async fn start_reports_a_spawn_failure() {
    let controller = ProcessController::new(null_probe());
    let target = common::target("svc", Some(free_port()));

    let result = controller
        .start(
            &target,
            StartOptions {
                wait_for_port: false,
                ..Default::default()
            },
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.current_status, Some(ServiceState::Stopped));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn start_times_out_when_the_port_never_opens() {
    let dir = tempfile::tempdir().unwrap();
    let target = script_target(&dir, "sleep 5", Some(free_port()));
    let controller = ProcessController::new(null_probe());

    let result = controller
        .start(
            &target,
            StartOptions {
                timeout: std::time::Duration::from_secs(1),
                wait_for_port: true,
            },
        )
        .await;
    assert!(!result.success);
    assert!(result.pid.is_some());
    // The process may still be coming up, so its state is honestly unknown.
    assert_eq!(result.current_status, Some(ServiceState::Unknown));
    assert!(result.error.as_deref().unwrap().contains("verify manually"));
}

#[tokio::test]
async fn start_without_port_wait_succeeds_on_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let target = script_target(&dir, "exit 0", Some(free_port()));
    let controller = ProcessController::new(null_probe());

    let result = controller
        .start(
            &target,
            StartOptions {
                wait_for_port: false,
                ..Default::default()
            },
        )
        .await;
    assert!(result.success);
    assert!(result.pid.is_some());
    assert_eq!(result.current_status, Some(ServiceState::Running));
    assert!(result.elapsed_ms.is_some());
}

#[tokio::test]
async fn restarting_a_stopped_target_just_starts_it() {
    let dir = tempfile::tempdir().unwrap();
    let target = script_target(&dir, "exit 0", Some(free_port()));
    let controller = ProcessController::new(null_probe());

    let result = controller
        .restart(
            &target,
            StartOptions {
                wait_for_port: false,
                ..Default::default()
            },
        )
        .await;
    assert!(result.success);
    // Elapsed covers the whole stop-settle-start sequence.
    assert!(result.elapsed_ms.unwrap() >= 1000);
}
