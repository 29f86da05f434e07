//! svcwatch-agent: a host-resident agent that supervises legacy ERP server
//! processes through the only signals they expose (open TCP ports and the
//! processes that own them) and turns those into a reliable event stream
//! delivered over signed webhooks and a live WebSocket feed.

pub mod config;
pub mod control;
pub mod monitor;
pub mod probe;
pub mod providers;
pub mod state;
pub mod types;
pub mod webhook;
pub mod ws;

use thiserror::Error;

/// Library-level error. Per-target, per-webhook and per-connection failures
/// are converted to data at their own scope and never surface here; this
/// covers the explicit operations callers invoke.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("webhook not found: {0}")]
    WebhookNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("config error: {0}")]
    Config(String),
}
