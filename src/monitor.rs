//! State monitor: samples every enabled target on a fixed interval, turns
//! noisy port/process observations into discrete lifecycle transitions and
//! publishes them on a typed broadcast channel.
//!
//! This owns the only long-lived shared mutable state in the core: the
//! previous-state, snapshot and start-instant tables, all keyed by target id
//! and only ever written from within a check.

use crate::probe::{self, PlatformProbe, ProcessMetrics};
use crate::providers::TargetProvider;
use crate::types::{Event, EventType, ServiceState, Snapshot, Target};
use crate::AgentError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime-settable monitor configuration. Every field defaults
/// independently so a partial config object parses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorOptions {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_enable_process_metrics")]
    pub enable_process_metrics: bool,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            poll_interval_ms: default_poll_interval_ms(),
            enable_process_metrics: default_enable_process_metrics(),
            stale_threshold_ms: default_stale_threshold_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_enable_process_metrics() -> bool {
    true
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

/// The three per-target tables live behind one lock so the read-compare-write
/// for a target is a single critical section with no suspension point inside.
#[derive(Default)]
struct Tables {
    previous: HashMap<String, ServiceState>,
    snapshots: HashMap<String, Snapshot>,
    /// Epoch-ms instant a target was first observed running; cleared on stop.
    started_at: HashMap<String, i64>,
}

pub struct StateMonitor {
    targets: Arc<dyn TargetProvider>,
    probe: Arc<dyn PlatformProbe>,
    options: RwLock<MonitorOptions>,
    tables: Mutex<Tables>,
    events: broadcast::Sender<Event>,
    running: AtomicBool,
}

impl StateMonitor {
    pub fn new(
        targets: Arc<dyn TargetProvider>,
        probe: Arc<dyn PlatformProbe>,
        options: MonitorOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(StateMonitor {
            targets,
            probe,
            options: RwLock::new(options),
            tables: Mutex::new(Tables::default()),
            events,
            running: AtomicBool::new(false),
        })
    }

    /// New receiver for the event stream. Consumers that fall behind see
    /// `Lagged` and pick up from the current position; the monitor never
    /// blocks on slow consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Spawns the poll loop. Cycle N+1 does not begin until every check of
    /// cycle N has settled.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("monitor already running");
            return;
        }
        let interval = self.options().poll_interval_ms;
        info!(poll_interval_ms = interval, "monitor starting");
        let mut details = Map::new();
        details.insert("pollIntervalMs".into(), interval.into());
        self.emit(Event::system(EventType::AgentStarted, details));

        while self.running.load(Ordering::SeqCst) {
            self.poll().await;
            let interval = self.options().poll_interval_ms;
            sleep(Duration::from_millis(interval)).await;
        }
    }

    /// Stops the poll loop after the in-flight cycle and announces it.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("monitor stopping");
        self.emit(Event::system(EventType::AgentStopped, Map::new()));
    }

    /// One full cycle: all enabled targets checked concurrently, each failure
    /// isolated to its own target.
    pub async fn poll(&self) {
        let targets: Vec<Target> = self
            .targets
            .targets()
            .into_iter()
            .filter(|t| t.enabled)
            .collect();
        futures::future::join_all(targets.iter().map(|t| self.check_target(t))).await;
    }

    /// Out-of-cycle check of one target (by id or name), without disturbing
    /// the periodic schedule.
    pub async fn refresh(&self, id: &str) -> Result<Snapshot, AgentError> {
        let target = self
            .targets
            .targets()
            .into_iter()
            .find(|t| t.id == id || t.name == id)
            .ok_or_else(|| AgentError::ServiceNotFound(id.to_string()))?;
        self.check_target(&target).await;
        self.snapshot(&target.id)
            .ok_or_else(|| AgentError::ServiceNotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: &str) -> Option<Snapshot> {
        self.tables.lock().unwrap().snapshots.get(id).cloned()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.tables
            .lock()
            .unwrap()
            .snapshots
            .values()
            .cloned()
            .collect()
    }

    /// True when there is no snapshot yet or the last one is older than the
    /// stale threshold.
    pub fn is_stale(&self, id: &str) -> bool {
        let threshold = self.options().stale_threshold_ms as i64;
        match self.snapshot(id) {
            Some(s) => Utc::now().timestamp_millis() - s.last_checked > threshold,
            None => true,
        }
    }

    pub fn options(&self) -> MonitorOptions {
        *self.options.read().unwrap()
    }

    /// Replaces the options, announces the change and forces a full poll so
    /// the new settings take effect immediately.
    pub async fn set_options(&self, options: MonitorOptions) {
        *self.options.write().unwrap() = options;
        let mut details = Map::new();
        details.insert("pollIntervalMs".into(), options.poll_interval_ms.into());
        details.insert(
            "enableProcessMetrics".into(),
            options.enable_process_metrics.into(),
        );
        self.emit(Event::system(EventType::ConfigChanged, details));
        self.poll().await;
    }

    async fn check_target(&self, target: &Target) {
        let port = probe::resolve_port(target).await;
        let mut state = ServiceState::Stopped;
        let mut pid = None;
        let mut metrics = ProcessMetrics::default();

        match port {
            Some(port) if probe::is_port_open(port).await => {
                state = ServiceState::Running;
                pid = self.probe.pid_for_port(port).await;
                if let Some(pid) = pid {
                    if self.options().enable_process_metrics {
                        metrics = self.probe.process_metrics(pid).await;
                    }
                }
            }
            Some(_) => {}
            None => {
                // Cannot determine a port at all: operationally the same as
                // "cannot confirm it's running", recorded as stopped.
                debug!(service = %target.name, "no resolvable port");
            }
        }

        let now = Utc::now().timestamp_millis();

        // Observation is done; the compare-and-replace below holds the table
        // lock with no await inside, so no other check of this target can
        // interleave with it.
        let event = {
            let mut tables = self.tables.lock().unwrap();
            let previous = tables
                .previous
                .get(&target.id)
                .copied()
                .unwrap_or(ServiceState::Unknown);

            if state == ServiceState::Running {
                tables.started_at.entry(target.id.clone()).or_insert(now);
            } else {
                tables.started_at.remove(&target.id);
            }
            let uptime_secs = tables
                .started_at
                .get(&target.id)
                .map(|s| ((now - s).max(0) / 1000) as u64);

            let snapshot = Snapshot {
                id: target.id.clone(),
                name: target.name.clone(),
                display_name: target.display_name.clone(),
                kind: target.kind,
                state,
                pid,
                port,
                memory_mb: metrics.memory_mb,
                cpu_percent: metrics.cpu_percent,
                uptime_secs,
                last_checked: now,
            };
            let emit = if previous != state && previous != ServiceState::Unknown {
                info!(service = %target.name, %previous, current = %state, "state transition");
                Some(Event::transition(target, previous, state, &snapshot))
            } else {
                None
            };
            tables.snapshots.insert(target.id.clone(), snapshot);
            tables.previous.insert(target.id.clone(), state);
            emit
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn emit(&self, event: Event) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}
