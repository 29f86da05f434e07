//! Shared handles the axum layer and background tasks clone.

use crate::control::ProcessController;
use crate::monitor::StateMonitor;
use crate::webhook::WebhookDispatcher;
use crate::ws::RealtimeGateway;
use std::sync::Arc;

/// Everything is explicitly constructed in the composition root and handed
/// out as `Arc`s; there are no process-global singletons.
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<StateMonitor>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub gateway: Arc<RealtimeGateway>,
    pub controller: Arc<ProcessController>,
}
