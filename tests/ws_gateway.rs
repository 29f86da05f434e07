//! Gateway behavior over real WebSocket connections: handshake auth,
//! subscription filtering, control messages and heartbeat eviction.

mod common;

use axum::{routing::get, Router};
use common::{agent_info, null_probe, service_event};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use svcwatch_agent::control::ProcessController;
use svcwatch_agent::monitor::{MonitorOptions, StateMonitor};
use svcwatch_agent::providers::{JsonFileStore, SharedSecretValidator, StaticTargets};
use svcwatch_agent::state::AppState;
use svcwatch_agent::types::EventType;
use svcwatch_agent::webhook::WebhookDispatcher;
use svcwatch_agent::ws::{ws_handler, RealtimeGateway};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_app(heartbeat: Duration) -> (AppState, SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let probe = null_probe();
    let monitor = StateMonitor::new(
        Arc::new(StaticTargets::new(Vec::new())),
        probe.clone(),
        MonitorOptions::default(),
    );
    let dispatcher = WebhookDispatcher::new(
        Arc::new(JsonFileStore::new(dir.path().join("webhooks.json"))),
        agent_info(),
    )
    .unwrap();
    let gateway = RealtimeGateway::new(
        Arc::new(SharedSecretValidator::new("secret")),
        monitor.clone(),
        heartbeat,
    );
    gateway.spawn_heartbeat();
    let controller = Arc::new(ProcessController::new(probe));
    let state = AppState {
        monitor,
        dispatcher,
        gateway,
        controller,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr, dir)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?token=secret"))
        .await
        .expect("handshake");
    ws
}

/// Next text frame as JSON; control frames (pings) are skipped.
async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn handshake_requires_a_valid_token() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;

    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws?token=wrong"))
        .await
        .is_err());
    assert_eq!(state.gateway.client_count().await, 0);
}

#[tokio::test]
async fn bearer_header_is_accepted_at_handshake() {
    let (_state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        "Bearer secret".parse().unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.expect("handshake");

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
}

#[tokio::test]
async fn welcome_carries_client_id_and_default_filter() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
    assert!(welcome["clientId"].is_string());
    assert_eq!(welcome["events"][0], "*");
    assert_eq!(state.gateway.client_count().await, 1);

    let clients = state.gateway.clients().await;
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].id.to_string(), welcome["clientId"]);
}

#[tokio::test]
async fn subscribe_then_unsubscribe_narrows_delivery() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await; // welcome

    send_json(
        &mut ws,
        json!({"type": "subscribe", "events": ["service:started", "service:stopped"]}),
    )
    .await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "subscribed");

    // Outside the filter: never delivered. The later stopped event proves it
    // by arriving first.
    state
        .gateway
        .broadcast(&service_event(EventType::ServiceHealthChanged))
        .await;
    state
        .gateway
        .broadcast(&service_event(EventType::ServiceStarted))
        .await;
    let got = next_json(&mut ws).await;
    assert_eq!(got["type"], "event");
    assert_eq!(got["event"]["type"], "service:started");

    send_json(
        &mut ws,
        json!({"type": "unsubscribe", "events": ["service:started"]}),
    )
    .await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "unsubscribed");

    state
        .gateway
        .broadcast(&service_event(EventType::ServiceStarted))
        .await;
    state
        .gateway
        .broadcast(&service_event(EventType::ServiceStopped))
        .await;
    let got = next_json(&mut ws).await;
    assert_eq!(got["event"]["type"], "service:stopped");
}

#[tokio::test]
async fn empty_live_filter_receives_everything() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await; // welcome

    send_json(&mut ws, json!({"type": "subscribe", "events": []})).await;
    assert_eq!(next_json(&mut ws).await["type"], "subscribed");

    state
        .gateway
        .broadcast(&service_event(EventType::ServiceHealthChanged))
        .await;
    let got = next_json(&mut ws).await;
    assert_eq!(got["event"]["type"], "service:health_changed");
}

#[tokio::test]
async fn targeted_push_reaches_exactly_one_client() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    let id: Uuid = next_json(&mut ws).await["clientId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let mut bystander = connect(addr).await;
    next_json(&mut bystander).await;

    let event = service_event(EventType::ServiceStopped);
    assert!(state.gateway.send_to_client(id, &event).await);

    let got = next_json(&mut ws).await;
    assert_eq!(got["type"], "event");
    assert_eq!(got["event"]["type"], "service:stopped");

    // The other connection saw nothing; a broadcast proves it by arriving
    // first.
    state
        .gateway
        .broadcast(&service_event(EventType::ServiceStarted))
        .await;
    let got = next_json(&mut bystander).await;
    assert_eq!(got["event"]["type"], "service:started");

    assert!(!state.gateway.send_to_client(Uuid::new_v4(), &event).await);
}

#[tokio::test]
async fn ping_status_and_error_responses() {
    let (_state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await; // welcome

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    send_json(&mut ws, json!({"type": "get_status"})).await;
    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert!(status["status"].is_array());

    send_json(&mut ws, json!({"type": "launch_missiles"})).await;
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
}

#[tokio::test]
async fn status_for_an_unknown_service_is_empty() {
    let (_state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "get_status", "serviceId": "missing"})).await;
    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert!(status["status"].as_array().map_or(false, |a| a.is_empty()));
}

#[tokio::test]
async fn unresponsive_client_is_evicted_after_two_heartbeats() {
    let (state, addr, _dir) = spawn_app(Duration::from_millis(100)).await;

    // Never read from this connection: pings are never answered because the
    // client-side auto-pong only happens on read.
    let ws = connect(addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.gateway.client_count().await, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(state.gateway.client_count().await, 0);
    drop(ws);
}

#[tokio::test]
async fn responsive_client_survives_heartbeats() {
    let (state, addr, _dir) = spawn_app(Duration::from_millis(100)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await; // welcome

    // Keep reading; tungstenite answers pings with pongs as frames arrive.
    let reader = tokio::spawn(async move {
        while let Some(Ok(_)) = ws.next().await {}
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(state.gateway.client_count().await, 1);
    reader.abort();
}

#[tokio::test]
async fn clean_disconnect_removes_the_client() {
    let (state, addr, _dir) = spawn_app(Duration::from_secs(30)).await;
    let mut ws = connect(addr).await;
    next_json(&mut ws).await;
    assert_eq!(state.gateway.client_count().await, 1);

    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.gateway.client_count().await, 0);
}
