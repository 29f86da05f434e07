#![allow(dead_code)]

use std::sync::Arc;
use svcwatch_agent::probe::{PlatformProbe, ProcessMetrics};
use svcwatch_agent::types::{
    AgentInfo, Event, EventType, ServiceKind, ServiceState, Target,
};

/// Probe that never resolves pids: the shape of a box with no privileges.
pub struct NullProbe;

#[async_trait::async_trait]
impl PlatformProbe for NullProbe {
    async fn pid_for_port(&self, _port: u16) -> Option<u32> {
        None
    }

    async fn process_alive(&self, _pid: u32) -> bool {
        false
    }

    async fn process_metrics(&self, _pid: u32) -> ProcessMetrics {
        ProcessMetrics::default()
    }
}

pub fn null_probe() -> Arc<dyn PlatformProbe> {
    Arc::new(NullProbe)
}

pub fn target(id: &str, port: Option<u16>) -> Target {
    Target {
        id: id.to_string(),
        name: id.to_string(),
        display_name: format!("Service {id}"),
        kind: ServiceKind::Appserver,
        enabled: true,
        port,
        ini_path: format!("/nonexistent/{id}.ini").into(),
        exe_path: format!("/nonexistent/{id}").into(),
        working_dir: None,
    }
}

/// A port that was just free. Bind-then-drop, so it can also be re-bound by
/// the test to flip a target to "running".
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn agent_info() -> AgentInfo {
    AgentInfo {
        id: "deadbeef".into(),
        hostname: "testhost".into(),
        version: "0.0.0-test".into(),
    }
}

pub fn service_event(kind: EventType) -> Event {
    Event {
        kind,
        service_id: Some("app-01".into()),
        service_name: Some("appserver".into()),
        timestamp: chrono::Utc::now().timestamp_millis(),
        previous_state: Some(ServiceState::Running),
        current_state: Some(ServiceState::Stopped),
        details: serde_json::Map::new(),
    }
}
