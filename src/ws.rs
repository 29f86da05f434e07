//! Realtime gateway: WebSocket fan-out of the monitor's event stream.
//!
//! Admission is a bearer-token check before the upgrade completes, so a
//! rejected client never gets a socket. Delivery is best effort: a live
//! dashboard only cares about the present, so there is no queueing or retry.
//! A heartbeat loop pings every connection and drops peers that stop
//! answering, bounding resource growth from vanished clients.

use crate::monitor::StateMonitor;
use crate::providers::TokenValidator;
use crate::state::AppState;
use crate::types::{Event, RealtimeClient, SubscriptionSet};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        events: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        events: Vec<String>,
    },
    Ping,
    #[serde(rename_all = "camelCase")]
    GetStatus {
        #[serde(default)]
        service_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        client_id: Uuid,
        events: Vec<String>,
    },
    Event {
        event: Event,
    },
    Subscribed {
        events: Vec<String>,
    },
    Unsubscribed {
        events: Vec<String>,
    },
    Status {
        status: Value,
    },
    Pong,
    Error {
        error: String,
    },
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<Message>,
    subscriptions: SubscriptionSet,
    connected_at: i64,
    /// Cleared on every heartbeat tick, restored by the peer's pong. Still
    /// false on the next tick means the peer is gone.
    alive: bool,
}

pub struct RealtimeGateway {
    validator: Arc<dyn TokenValidator>,
    monitor: Arc<StateMonitor>,
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
    heartbeat: Duration,
}

impl RealtimeGateway {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        monitor: Arc<StateMonitor>,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(RealtimeGateway {
            validator,
            monitor,
            clients: Mutex::new(HashMap::new()),
            heartbeat,
        })
    }

    pub fn authorize(&self, token: &str) -> bool {
        self.validator.validate(token)
    }

    /// Pushes the event to every connection whose filter matches. Writes to
    /// a connection that is no longer writable are dropped silently.
    pub async fn broadcast(&self, event: &Event) {
        let payload = match serde_json::to_string(&ServerMessage::Event {
            event: event.clone(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "event serialization failed");
                return;
            }
        };
        let clients = self.clients.lock().await;
        for entry in clients.values() {
            if entry.subscriptions.matches_or_all(event.kind) {
                let _ = entry.tx.send(Message::Text(payload.clone()));
            }
        }
    }

    /// Targeted push to one connection. False when the client is gone.
    pub async fn send_to_client(&self, id: Uuid, event: &Event) -> bool {
        let clients = self.clients.lock().await;
        match clients.get(&id) {
            Some(entry) => send(&entry.tx, &ServerMessage::Event {
                event: event.clone(),
            }),
            None => false,
        }
    }

    pub async fn clients(&self) -> Vec<RealtimeClient> {
        self.clients
            .lock()
            .await
            .iter()
            .map(|(id, entry)| RealtimeClient {
                id: *id,
                subscriptions: entry.subscriptions.clone(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Heartbeat loop: evict peers that missed the previous ping, then ping
    /// the rest. Runs until the returned handle is dropped/aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so fresh connections get
            // a full interval before their first ping.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.reap_and_ping().await;
            }
        })
    }

    async fn reap_and_ping(&self) {
        let mut clients = self.clients.lock().await;
        clients.retain(|id, entry| {
            if !entry.alive {
                info!(client = %id, "client missed heartbeat, dropping");
                return false;
            }
            true
        });
        for entry in clients.values_mut() {
            entry.alive = false;
            let _ = entry.tx.send(Message::Ping(Vec::new()));
        }
    }

    /// Drops every connection; their writer tasks send a close frame on the
    /// way out. Used at shutdown.
    pub async fn close_all(&self) {
        self.clients.lock().await.clear();
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let subscriptions = SubscriptionSet::all();
        let welcome = ServerMessage::Connected {
            client_id: id,
            events: subscriptions.entries().to_vec(),
        };
        {
            let mut clients = self.clients.lock().await;
            clients.insert(
                id,
                ClientEntry {
                    tx: tx.clone(),
                    subscriptions,
                    connected_at: Utc::now().timestamp_millis(),
                    alive: true,
                },
            );
            info!(client = %id, total = clients.len(), "client connected");
        }
        send(&tx, &welcome);

        let (mut sink, mut stream) = socket.split();

        // Writer: drains the per-client queue until the entry is dropped
        // (disconnect, eviction, shutdown), then says goodbye.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => self.handle_message(id, &text).await,
                Message::Pong(_) => self.mark_alive(id).await,
                Message::Close(_) => break,
                _ => {}
            }
        }

        {
            let mut clients = self.clients.lock().await;
            clients.remove(&id);
            info!(client = %id, total = clients.len(), "client disconnected");
        }
        // Entry (and its tx) is gone; the writer drains and exits on its own.
        drop(writer);
    }

    async fn handle_message(&self, id: Uuid, raw: &str) {
        let parsed: Result<ClientMessage, _> = serde_json::from_str(raw);
        let mut clients = self.clients.lock().await;
        let Some(entry) = clients.get_mut(&id) else {
            return;
        };
        match parsed {
            Ok(ClientMessage::Subscribe { events }) => {
                entry.subscriptions = SubscriptionSet::new(events.clone());
                send(&entry.tx, &ServerMessage::Subscribed { events });
            }
            Ok(ClientMessage::Unsubscribe { events }) => {
                entry.subscriptions.remove_all(&events);
                send(&entry.tx, &ServerMessage::Unsubscribed { events });
            }
            Ok(ClientMessage::Ping) => {
                send(&entry.tx, &ServerMessage::Pong);
            }
            Ok(ClientMessage::GetStatus { service_id }) => {
                // Whatever the last cycle produced; no fresh poll.
                let status = match service_id {
                    Some(ref sid) => self
                        .monitor
                        .snapshot(sid)
                        .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
                        .unwrap_or(Value::Array(Vec::new())),
                    None => serde_json::to_value(self.monitor.snapshots())
                        .unwrap_or(Value::Array(Vec::new())),
                };
                send(&entry.tx, &ServerMessage::Status { status });
            }
            Err(err) => {
                debug!(client = %id, error = %err, "bad client message");
                send(&entry.tx, &ServerMessage::Error {
                    error: "invalid message format".into(),
                });
            }
        }
    }

    async fn mark_alive(&self, id: Uuid) {
        if let Some(entry) = self.clients.lock().await.get_mut(&id) {
            entry.alive = true;
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(payload) => tx.send(Message::Text(payload)).is_ok(),
        Err(_) => false,
    }
}

/// `/ws` upgrade handler. The token comes as a `token` query parameter or a
/// bearer Authorization header; missing or invalid tokens are rejected before
/// the handshake completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| bearer_token(&headers));
    match token {
        Some(token) if state.gateway.authorize(&token) => {
            let gateway = state.gateway.clone();
            ws.on_upgrade(move |socket| gateway.handle_socket(socket))
        }
        Some(_) => (StatusCode::FORBIDDEN, "invalid token").into_response(),
        None => (StatusCode::UNAUTHORIZED, "token required").into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
