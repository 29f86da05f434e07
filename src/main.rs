//! svcwatch-agent entrypoint.
//!
//! Everything is constructed here, explicitly, and wired together through
//! typed channels: monitor -> {webhook dispatcher, realtime gateway}. The
//! HTTP surface is just the WebSocket endpoint; the surrounding API layer
//! mounts the query operations itself.

use anyhow::Context;
use axum::{routing::get, Router};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svcwatch_agent::config::{self, AgentConfig};
use svcwatch_agent::control::ProcessController;
use svcwatch_agent::monitor::StateMonitor;
use svcwatch_agent::probe::{HostProbe, PlatformProbe};
use svcwatch_agent::providers::{JsonFileStore, SharedSecretValidator, StaticTargets};
use svcwatch_agent::state::AppState;
use svcwatch_agent::types::{AgentInfo, Event};
use svcwatch_agent::webhook::WebhookDispatcher;
use svcwatch_agent::ws::{self, RealtimeGateway};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = config::config_path_from_args(std::env::args());
    let cfg = AgentConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let agent = agent_info();
    info!(
        agent = %agent.id,
        host = %agent.hostname,
        version = %agent.version,
        targets = cfg.targets.len(),
        "svcwatch-agent starting"
    );

    let probe: Arc<dyn PlatformProbe> = Arc::new(HostProbe::new());
    let targets = Arc::new(StaticTargets::new(cfg.targets));
    let store = Arc::new(JsonFileStore::new(&cfg.webhooks_path));
    let validator = Arc::new(SharedSecretValidator::new(&cfg.token));

    let monitor = StateMonitor::new(targets, probe.clone(), cfg.monitor);
    let controller = Arc::new(ProcessController::new(probe));
    let dispatcher = WebhookDispatcher::new(store, agent).context("loading webhook store")?;
    let gateway = RealtimeGateway::new(validator, monitor.clone(), HEARTBEAT_INTERVAL);

    // Fan the event stream out to both consumers. Each webhook dispatch runs
    // in its own task so one event's retries never delay the next event.
    spawn_webhook_pump(monitor.subscribe(), dispatcher.clone());
    spawn_gateway_pump(monitor.subscribe(), gateway.clone());

    let heartbeat = gateway.spawn_heartbeat();
    let poller = monitor.spawn();

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(AppState {
            monitor: monitor.clone(),
            dispatcher,
            gateway: gateway.clone(),
            controller,
        });

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "realtime endpoint listening at /ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    monitor.shutdown();
    gateway.close_all().await;
    poller.abort();
    heartbeat.abort();
    Ok(())
}

fn spawn_webhook_pump(mut rx: broadcast::Receiver<Event>, dispatcher: Arc<WebhookDispatcher>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move { dispatcher.dispatch(&event).await });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "webhook consumer lagged behind the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_gateway_pump(mut rx: broadcast::Receiver<Event>, gateway: Arc<RealtimeGateway>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => gateway.broadcast(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "realtime consumer lagged behind the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn agent_info() -> AgentInfo {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    let id = hex::encode(hasher.finalize())[..8].to_string();
    AgentInfo {
        id,
        hostname: host,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
