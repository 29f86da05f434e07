//! Port and process observation.
//!
//! The supervised servers expose no health API, so everything here is
//! inference from system state: a short-timeout TCP connect answers "is the
//! port occupied", the OS socket table answers "which pid owns it", and
//! sysinfo supplies that pid's footprint. Socket-table lookups shell out to
//! `ss`/`lsof`; the parsing lives in pure functions tested against captured
//! output.

use crate::types::{ServiceKind, Target};
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Probe connect deadline. Refusal or timeout both read as "free".
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// True when something accepts connections on the port. No side effects.
pub async fn is_port_open(port: u16) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Memory/CPU footprint of one process. Either field may be unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMetrics {
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<f32>,
}

/// OS-level process-table queries, one implementation per platform.
///
/// `pid_for_port` is best effort: it may return `None` even when the port is
/// open (insufficient privilege, platform limitation). Callers must treat
/// that as "running, pid unknown", never as "stopped".
#[async_trait]
pub trait PlatformProbe: Send + Sync {
    async fn pid_for_port(&self, port: u16) -> Option<u32>;
    async fn process_alive(&self, pid: u32) -> bool;
    async fn process_metrics(&self, pid: u32) -> ProcessMetrics;
}

/// Probe backed by the host OS. Keeps one persistent sysinfo handle so CPU
/// usage is a delta between consecutive polls rather than always zero.
pub struct HostProbe {
    sys: Mutex<System>,
}

impl HostProbe {
    pub fn new() -> Self {
        HostProbe {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformProbe for HostProbe {
    async fn pid_for_port(&self, port: u16) -> Option<u32> {
        #[cfg(target_os = "linux")]
        {
            if let Some(out) = run_capture("ss", &["-tlnp"]).await {
                if let Some(pid) = parse_ss_listen_pid(&out, port) {
                    return Some(pid);
                }
            }
            // Fallback when ss is unavailable or ran unprivileged.
            let selector = format!(":{port}");
            if let Some(out) = run_capture("lsof", &["-ti", &selector, "-sTCP:LISTEN"]).await {
                return parse_lsof_pid(&out);
            }
            None
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = port;
            None
        }
    }

    async fn process_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid as NixPid;
            match kill(NixPid::from_raw(pid as i32), None) {
                Ok(()) => true,
                // Alive but owned by someone else.
                Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }
        #[cfg(not(unix))]
        {
            let mut sys = self.sys.lock().await;
            sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
                true,
                ProcessRefreshKind::nothing(),
            );
            sys.process(Pid::from_u32(pid)).is_some()
        }
    }

    async fn process_metrics(&self, pid: u32) -> ProcessMetrics {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        match sys.process(Pid::from_u32(pid)) {
            Some(p) => ProcessMetrics {
                memory_mb: Some(p.memory() / (1024 * 1024)),
                cpu_percent: Some(p.cpu_usage()),
            },
            None => ProcessMetrics::default(),
        }
    }
}

#[cfg(target_os = "linux")]
async fn run_capture(cmd: &str, args: &[&str]) -> Option<String> {
    match tokio::process::Command::new(cmd).args(args).output().await {
        Ok(out) => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Err(err) => {
            tracing::debug!(cmd, error = %err, "socket-table lookup unavailable");
            None
        }
    }
}

/// Picks the pid out of an `ss -tlnp` listing for a given listen port.
///
/// Sample row:
/// `LISTEN 0 4096 127.0.0.1:1234 0.0.0.0:* users:(("appsrv",pid=4242,fd=12))`
pub fn parse_ss_listen_pid(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.first() != Some(&"LISTEN") {
            continue;
        }
        let local = match cols.get(3) {
            Some(l) => *l,
            None => continue,
        };
        if !local.ends_with(&suffix) {
            continue;
        }
        if let Some(pid) = extract_pid_field(line) {
            return Some(pid);
        }
    }
    None
}

/// First pid in `lsof -ti :<port> -sTCP:LISTEN` output (one pid per line).
pub fn parse_lsof_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|l| l.trim().parse().ok())
}

fn extract_pid_field(line: &str) -> Option<u32> {
    let idx = line.find("pid=")?;
    let digits: String = line[idx + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Port the monitor should probe for this target: the statically configured
/// one when present, else whatever the INI file declares. `None` means the
/// port cannot be determined at all, which the monitor treats as stopped.
pub async fn resolve_port(target: &Target) -> Option<u16> {
    if let Some(port) = target.port {
        if port > 0 {
            return Some(port);
        }
    }
    let bytes = tokio::fs::read(&target.ini_path).await.ok()?;
    detect_port_in_ini(&decode_latin1(&bytes), target.kind)
}

/// INI files from these servers are latin-1, not UTF-8.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Scans INI content for `PORT=`/`TCPPORT=`; license servers fall back to
/// `LICENSESVRPORT=` when neither is present.
pub fn detect_port_in_ini(content: &str, kind: ServiceKind) -> Option<u16> {
    let mut license_fallback = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("port") || key.eq_ignore_ascii_case("tcpport") {
            if let Some(port) = leading_number(value) {
                return Some(port);
            }
        }
        if kind == ServiceKind::License
            && license_fallback.is_none()
            && key.eq_ignore_ascii_case("licensesvrport")
        {
            license_fallback = leading_number(value);
        }
    }
    license_fallback
}

fn leading_number(value: &str) -> Option<u16> {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
