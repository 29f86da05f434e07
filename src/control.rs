//! Process controller: start, stop and restart one supervised target,
//! confirming effect through the port probe and bounding every operation
//! with a deadline.
//!
//! Spawned children are detached into their own process group so an agent
//! restart never takes the supervised servers down with it.

use crate::probe::{self, PlatformProbe};
use crate::types::{OperationResult, ServiceState, Target};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

/// Grace period after spawn before the port is first checked.
const SPAWN_SETTLE: Duration = Duration::from_secs(2);
/// Pause between stop and start during a restart.
const RESTART_SETTLE: Duration = Duration::from_secs(1);
/// How often port/exit conditions are re-checked while waiting.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub timeout: Duration,
    pub wait_for_port: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        StartOptions {
            timeout: Duration::from_secs(60),
            wait_for_port: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub timeout: Duration,
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        StopOptions {
            timeout: Duration::from_secs(30),
            force: false,
        }
    }
}

pub struct ProcessController {
    probe: Arc<dyn PlatformProbe>,
}

impl ProcessController {
    pub fn new(probe: Arc<dyn PlatformProbe>) -> Self {
        ProcessController { probe }
    }

    /// Spawns the target's executable detached and, when asked, waits for its
    /// port to open. Failure to observe the port within the deadline is
    /// reported as failure even though the process may still be alive.
    pub async fn start(&self, target: &Target, opts: StartOptions) -> OperationResult {
        let started = Instant::now();
        let port = probe::resolve_port(target).await;
        info!(service = %target.id, ?port, "starting service");

        if let Some(port) = port {
            if probe::is_port_open(port).await {
                return OperationResult {
                    success: false,
                    service: target.id.clone(),
                    previous_status: Some(ServiceState::Running),
                    current_status: Some(ServiceState::Running),
                    pid: None,
                    port: Some(port),
                    elapsed_ms: None,
                    error: Some("service is already running".into()),
                };
            }
        }

        let pid = match spawn_detached(target) {
            Ok(pid) => pid,
            Err(err) => {
                warn!(service = %target.id, error = %err, "spawn failed");
                return OperationResult {
                    success: false,
                    service: target.id.clone(),
                    previous_status: Some(ServiceState::Stopped),
                    current_status: Some(ServiceState::Stopped),
                    pid: None,
                    port,
                    elapsed_ms: Some(started.elapsed().as_millis() as u64),
                    error: Some(err.to_string()),
                };
            }
        };

        sleep(SPAWN_SETTLE).await;

        if opts.wait_for_port {
            if let Some(port) = port {
                if !wait_for_port_open(port, opts.timeout).await {
                    return OperationResult {
                        success: false,
                        service: target.id.clone(),
                        previous_status: Some(ServiceState::Stopped),
                        current_status: Some(ServiceState::Unknown),
                        pid,
                        port: Some(port),
                        elapsed_ms: Some(started.elapsed().as_millis() as u64),
                        error: Some(format!(
                            "timed out waiting for port {port} to open; verify manually"
                        )),
                    };
                }
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        info!(service = %target.id, elapsed_ms = elapsed, "service started");
        OperationResult {
            success: true,
            service: target.id.clone(),
            previous_status: Some(ServiceState::Stopped),
            current_status: Some(ServiceState::Running),
            pid,
            port,
            elapsed_ms: Some(elapsed),
            error: None,
        }
    }

    /// Graceful-then-forced stop. Sends SIGTERM, polls for exit up to the
    /// deadline, escalates to SIGKILL; `force` skips straight to SIGKILL.
    /// Stopping an already-stopped target succeeds without sending anything.
    pub async fn stop(&self, target: &Target, opts: StopOptions) -> OperationResult {
        let started = Instant::now();
        let port = probe::resolve_port(target).await;
        info!(service = %target.id, ?port, force = opts.force, "stopping service");

        let running = match port {
            Some(port) => probe::is_port_open(port).await,
            None => false,
        };
        if !running {
            return OperationResult {
                success: true,
                service: target.id.clone(),
                previous_status: Some(ServiceState::Stopped),
                current_status: Some(ServiceState::Stopped),
                pid: None,
                port,
                elapsed_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            };
        }

        // Port is guaranteed Some here: running implies a resolved port.
        let pid = match self.probe.pid_for_port(port.unwrap_or(0)).await {
            Some(pid) => pid,
            None => {
                return OperationResult {
                    success: false,
                    service: target.id.clone(),
                    previous_status: Some(ServiceState::Running),
                    current_status: Some(ServiceState::Running),
                    pid: None,
                    port,
                    elapsed_ms: Some(started.elapsed().as_millis() as u64),
                    error: Some("service is running but its pid could not be resolved".into()),
                };
            }
        };

        if opts.force {
            send_kill(pid);
        } else {
            send_term(pid);
            if !self.wait_for_exit(pid, opts.timeout).await {
                warn!(service = %target.id, pid, "graceful shutdown timed out, escalating");
                send_kill(pid);
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        info!(service = %target.id, pid, elapsed_ms = elapsed, "service stopped");
        OperationResult {
            success: true,
            service: target.id.clone(),
            previous_status: Some(ServiceState::Running),
            current_status: Some(ServiceState::Stopped),
            pid: Some(pid),
            port,
            elapsed_ms: Some(elapsed),
            error: None,
        }
    }

    /// Stop then start, summing elapsed time. A target that was not running
    /// to begin with is not a restart failure.
    pub async fn restart(&self, target: &Target, opts: StartOptions) -> OperationResult {
        let started = Instant::now();
        info!(service = %target.id, "restarting service");

        let stop = self
            .stop(
                target,
                StopOptions {
                    timeout: opts.timeout / 2,
                    force: false,
                },
            )
            .await;
        if !stop.success {
            return OperationResult {
                success: false,
                service: target.id.clone(),
                previous_status: stop.previous_status,
                current_status: stop.current_status,
                pid: stop.pid,
                port: stop.port,
                elapsed_ms: Some(started.elapsed().as_millis() as u64),
                error: Some(format!(
                    "restart aborted: {}",
                    stop.error.unwrap_or_else(|| "stop failed".into())
                )),
            };
        }

        sleep(RESTART_SETTLE).await;

        let mut start = self
            .start(
                target,
                StartOptions {
                    timeout: opts.timeout / 2,
                    wait_for_port: opts.wait_for_port,
                },
            )
            .await;
        start.elapsed_ms = Some(started.elapsed().as_millis() as u64);
        start
    }

    async fn wait_for_exit(&self, pid: u32, deadline: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if !self.probe.process_alive(pid).await {
                return true;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
        false
    }
}

async fn wait_for_port_open(port: u16, deadline: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if probe::is_port_open(port).await {
            return true;
        }
        sleep(WAIT_POLL_INTERVAL).await;
    }
    false
}

/// Spawns the target executable in console mode, detached from the agent's
/// process group with stdio discarded. The child handle is dropped without
/// waiting; tokio reaps orphans in the background.
fn spawn_detached(target: &Target) -> std::io::Result<Option<u32>> {
    let cwd = target
        .working_dir
        .clone()
        .or_else(|| target.exe_path.parent().map(|p| p.to_path_buf()));

    let mut cmd = tokio::process::Command::new(&target.exe_path);
    cmd.arg("-console")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    Ok(child.id())
}

#[cfg(unix)]
fn send_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_term(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn send_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status();
}
