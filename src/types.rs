//! Wire-format and domain types shared across the agent.
//! Keep this module minimal and stable; it defines the JSON shapes consumers see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Closed set of service kinds the discovery collaborator hands us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Appserver,
    Dbaccess,
    License,
    Rest,
}

/// Lifecycle state of a supervised service.
///
/// The monitor only ever assigns `Running` or `Stopped` from observation;
/// `Unknown` appears as the previous state before the first completed poll
/// and in operation results when an outcome could not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One supervised external process, identified by the port it is expected to
/// occupy. Owned by the discovery collaborator; the core reads it as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub kind: ServiceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Statically known port; when absent the monitor scans the INI file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub ini_path: PathBuf,
    pub exe_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// The monitor's latest observed view of one target. Replaced wholesale on
/// every check; readers never see a half-updated snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub kind: ServiceKind,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Wall-clock time of the last successful check, epoch milliseconds.
    pub last_checked: i64,
}

/// Closed tagged set of event types. Adding a variant is a compile-time
/// checked change for every consumer match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "service:started")]
    ServiceStarted,
    #[serde(rename = "service:stopped")]
    ServiceStopped,
    #[serde(rename = "service:health_changed")]
    ServiceHealthChanged,
    #[serde(rename = "system:agent_started")]
    AgentStarted,
    #[serde(rename = "system:agent_stopped")]
    AgentStopped,
    #[serde(rename = "system:config_changed")]
    ConfigChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ServiceStarted => "service:started",
            EventType::ServiceStopped => "service:stopped",
            EventType::ServiceHealthChanged => "service:health_changed",
            EventType::AgentStarted => "system:agent_started",
            EventType::AgentStopped => "system:agent_stopped",
            EventType::ConfigChanged => "system:config_changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable transition record dispatched to webhook and realtime consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<ServiceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<ServiceState>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl Event {
    /// Agent-lifecycle or config-change event, not tied to one service.
    pub fn system(kind: EventType, details: Map<String, Value>) -> Self {
        Event {
            kind,
            service_id: None,
            service_name: None,
            timestamp: Utc::now().timestamp_millis(),
            previous_state: None,
            current_state: None,
            details,
        }
    }

    /// State-transition event for one service.
    pub fn transition(
        target: &Target,
        previous: ServiceState,
        current: ServiceState,
        snapshot: &Snapshot,
    ) -> Self {
        let kind = match (previous, current) {
            (ServiceState::Running, ServiceState::Stopped) => EventType::ServiceStopped,
            (ServiceState::Stopped, ServiceState::Running) => EventType::ServiceStarted,
            _ => EventType::ServiceHealthChanged,
        };
        let mut details = Map::new();
        if let Some(pid) = snapshot.pid {
            details.insert("pid".into(), pid.into());
        }
        if let Some(port) = snapshot.port {
            details.insert("port".into(), port.into());
        }
        Event {
            kind,
            service_id: Some(target.id.clone()),
            service_name: Some(target.name.clone()),
            timestamp: Utc::now().timestamp_millis(),
            previous_state: Some(previous),
            current_state: Some(current),
            details,
        }
    }
}

/// Which event types a consumer wants. Entries are event-type names, with
/// `"*"` meaning everything. Shared by webhook registrations and realtime
/// clients, which differ only in how they read an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionSet(Vec<String>);

impl SubscriptionSet {
    pub fn new(entries: Vec<String>) -> Self {
        SubscriptionSet(entries)
    }

    pub fn all() -> Self {
        SubscriptionSet(vec!["*".to_string()])
    }

    /// True when the set names the event type or carries the wildcard. An
    /// empty set matches nothing; webhook dispatch reads it this way.
    pub fn matches(&self, kind: EventType) -> bool {
        self.0.iter().any(|e| e == "*" || e == kind.as_str())
    }

    /// Live-connection reading: an empty filter means everything.
    pub fn matches_or_all(&self, kind: EventType) -> bool {
        self.0.is_empty() || self.matches(kind)
    }

    /// Set-difference narrowing, used by the gateway's `unsubscribe`.
    pub fn remove_all(&mut self, entries: &[String]) {
        self.0.retain(|e| !entries.contains(e));
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }
}

fn default_true() -> bool {
    true
}

/// Keeps an explicit `null` distinguishable from an absent field in patch
/// payloads, where plain `Option<Option<T>>` would collapse both to `None`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// A registered webhook endpoint. Health fields (`last_*`, `failure_count`)
/// are the only parts mutated outside explicit CRUD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "SubscriptionSet::all")]
    pub events: SubscriptionSet,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<DeliveryStatus>,
    #[serde(default)]
    pub failure_count: u32,
}

/// Creation parameters for a webhook; everything not given takes the
/// registration defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDraft {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "SubscriptionSet::all")]
    pub events: SubscriptionSet,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Absent leaves the secret untouched; an explicit JSON `null` clears it,
    /// turning signing off.
    #[serde(default, deserialize_with = "double_option")]
    pub secret: Option<Option<String>>,
    #[serde(default)]
    pub events: Option<SubscriptionSet>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// Outcome of one full attempt-set (all retries) for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub webhook_id: String,
    pub payload_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Result of a start/stop/restart issued against one target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ServiceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<ServiceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity stamped into every webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub hostname: String,
    pub version: String,
}

/// One live realtime connection, as reported to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeClient {
    pub id: uuid::Uuid,
    pub subscriptions: SubscriptionSet,
    /// Epoch milliseconds.
    pub connected_at: i64,
}
