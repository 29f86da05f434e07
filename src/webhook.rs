//! Webhook dispatcher: at-least-once delivery of events to registered HTTP
//! endpoints, with bounded retries, exponential backoff, HMAC signing and a
//! capped delivery ledger.
//!
//! The payload is serialized exactly once per attempt-set, so the body and
//! its signature are identical across retries.

use crate::providers::WebhookStore;
use crate::types::{
    AgentInfo, DeliveryRecord, DeliveryStatus, Event, EventType, Webhook, WebhookDraft,
    WebhookPatch,
};
use crate::AgentError;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Oldest ledger entries are evicted past this point.
const MAX_LEDGER_SIZE: usize = 1000;

pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    agent: AgentInfo,
    client: reqwest::Client,
    webhooks: RwLock<HashMap<String, Webhook>>,
    ledger: Mutex<VecDeque<DeliveryRecord>>,
}

impl WebhookDispatcher {
    /// Loads registrations from the store and builds the shared HTTP client.
    pub fn new(store: Arc<dyn WebhookStore>, agent: AgentInfo) -> Result<Arc<Self>, AgentError> {
        let loaded = store.load()?;
        info!(count = loaded.len(), "webhooks loaded");
        let webhooks = loaded.into_iter().map(|w| (w.id.clone(), w)).collect();
        Ok(Arc::new(WebhookDispatcher {
            store,
            agent,
            client: reqwest::Client::new(),
            webhooks: RwLock::new(webhooks),
            ledger: Mutex::new(VecDeque::new()),
        }))
    }

    // ---------- registration CRUD ----------

    pub async fn list(&self) -> Vec<Webhook> {
        self.webhooks.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Webhook> {
        self.webhooks.read().await.get(id).cloned()
    }

    pub async fn create(&self, draft: WebhookDraft) -> Webhook {
        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            url: draft.url,
            secret: draft.secret,
            events: draft.events,
            enabled: draft.enabled,
            retry_count: draft.retry_count,
            retry_delay_ms: draft.retry_delay_ms,
            timeout_ms: draft.timeout_ms,
            headers: draft.headers,
            created_at: now,
            updated_at: now,
            last_triggered_at: None,
            last_status: None,
            failure_count: 0,
        };
        info!(webhook = %webhook.id, name = %webhook.name, "webhook created");
        self.webhooks
            .write()
            .await
            .insert(webhook.id.clone(), webhook.clone());
        self.persist().await;
        webhook
    }

    pub async fn update(&self, id: &str, patch: WebhookPatch) -> Result<Webhook, AgentError> {
        let updated = {
            let mut webhooks = self.webhooks.write().await;
            let webhook = webhooks
                .get_mut(id)
                .ok_or_else(|| AgentError::WebhookNotFound(id.to_string()))?;
            if let Some(name) = patch.name {
                webhook.name = name;
            }
            if let Some(url) = patch.url {
                webhook.url = url;
            }
            if let Some(secret) = patch.secret {
                webhook.secret = secret;
            }
            if let Some(events) = patch.events {
                webhook.events = events;
            }
            if let Some(enabled) = patch.enabled {
                webhook.enabled = enabled;
            }
            if let Some(retry_count) = patch.retry_count {
                webhook.retry_count = retry_count;
            }
            if let Some(retry_delay_ms) = patch.retry_delay_ms {
                webhook.retry_delay_ms = retry_delay_ms;
            }
            if let Some(timeout_ms) = patch.timeout_ms {
                webhook.timeout_ms = timeout_ms;
            }
            if let Some(headers) = patch.headers {
                webhook.headers = headers;
            }
            webhook.updated_at = Utc::now();
            webhook.clone()
        };
        info!(webhook = %id, "webhook updated");
        self.persist().await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), AgentError> {
        let removed = self.webhooks.write().await.remove(id);
        match removed {
            Some(webhook) => {
                info!(webhook = %id, name = %webhook.name, "webhook deleted");
                self.persist().await;
                Ok(())
            }
            None => Err(AgentError::WebhookNotFound(id.to_string())),
        }
    }

    // ---------- delivery ----------

    /// Delivers the event to every enabled registration whose subscription
    /// set matches, independently and concurrently. One endpoint's failure
    /// never affects another's delivery.
    pub async fn dispatch(&self, event: &Event) {
        let interested: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|w| w.enabled && w.events.matches(event.kind))
            .cloned()
            .collect();
        if interested.is_empty() {
            return;
        }
        debug!(event = %event.kind, count = interested.len(), "dispatching to webhooks");
        futures::future::join_all(
            interested
                .into_iter()
                .map(|w| self.deliver(w, event, false)),
        )
        .await;
    }

    /// Runs the exact delivery path against a synthetic event, bypassing the
    /// subscription filter and health-field updates. For operator-initiated
    /// connectivity checks.
    pub async fn test(&self, id: &str) -> Result<DeliveryRecord, AgentError> {
        let webhook = self
            .get(id)
            .await
            .ok_or_else(|| AgentError::WebhookNotFound(id.to_string()))?;
        let mut details = serde_json::Map::new();
        details.insert("test".into(), true.into());
        let event = Event::system(EventType::AgentStarted, details);
        Ok(self.deliver(webhook, &event, true).await)
    }

    /// Ledger entries, oldest first, optionally filtered by webhook id and
    /// bounded to the last `limit`.
    pub async fn delivery_history(
        &self,
        webhook_id: Option<&str>,
        limit: usize,
    ) -> Vec<DeliveryRecord> {
        let ledger = self.ledger.lock().await;
        let filtered: Vec<DeliveryRecord> = ledger
            .iter()
            .filter(|r| webhook_id.map_or(true, |id| r.webhook_id == id))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// One full attempt-set for one registration: up to `retry_count + 1`
    /// sequential attempts over the same serialized body, one ledger entry
    /// for the outcome of the whole set.
    async fn deliver(&self, webhook: Webhook, event: &Event, is_test: bool) -> DeliveryRecord {
        let payload_id = Uuid::new_v4().to_string();
        let payload = serde_json::json!({
            "id": payload_id,
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "agent": self.agent,
        });
        let body = payload.to_string();
        let signature = webhook.secret.as_deref().map(|s| sign(s, &body));

        let mut last_error = None;
        let mut status_code = None;
        let mut response_time = None;
        let mut attempts = 0;

        for i in 0..=webhook.retry_count {
            attempts = i + 1;
            match self.attempt(&webhook, &body, signature.as_deref()).await {
                Ok((status, elapsed_ms)) => {
                    status_code = Some(status);
                    response_time = Some(elapsed_ms);
                    if (200..300).contains(&status) {
                        let record = self
                            .record(&webhook, &payload_id, true, status_code, response_time, None, attempts)
                            .await;
                        if !is_test {
                            self.update_health(&webhook.id, true).await;
                        }
                        return record;
                    }
                    last_error = Some(format!("HTTP {status}"));
                }
                Err(err) => last_error = Some(err),
            }
            if i < webhook.retry_count {
                sleep(backoff_delay(webhook.retry_delay_ms, i)).await;
            }
        }

        warn!(
            webhook = %webhook.id,
            attempts,
            error = last_error.as_deref().unwrap_or("unknown"),
            "delivery exhausted"
        );
        let record = self
            .record(
                &webhook,
                &payload_id,
                false,
                status_code,
                response_time,
                last_error,
                attempts,
            )
            .await;
        if !is_test {
            self.update_health(&webhook.id, false).await;
        }
        record
    }

    async fn attempt(
        &self,
        webhook: &Webhook,
        body: &str,
        signature: Option<&str>,
    ) -> Result<(u16, u64), String> {
        let started = Instant::now();
        let mut request = self
            .client
            .post(&webhook.url)
            .timeout(Duration::from_millis(webhook.timeout_ms))
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, format!("svcwatch-agent/{}", self.agent.version))
            .header("X-Webhook-ID", &webhook.id);
        for (key, value) in &webhook.headers {
            request = request.header(key, value);
        }
        if let Some(signature) = signature {
            request = request.header("X-Signature-256", signature);
        }
        match request.body(body.to_string()).send().await {
            Ok(response) => Ok((
                response.status().as_u16(),
                started.elapsed().as_millis() as u64,
            )),
            Err(err) => Err(err.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        webhook: &Webhook,
        payload_id: &str,
        success: bool,
        status_code: Option<u16>,
        response_time_ms: Option<u64>,
        error: Option<String>,
        attempts: u32,
    ) -> DeliveryRecord {
        let record = DeliveryRecord {
            webhook_id: webhook.id.clone(),
            payload_id: payload_id.to_string(),
            success,
            status_code,
            response_time_ms,
            error,
            attempts,
            timestamp: Utc::now(),
        };
        let mut ledger = self.ledger.lock().await;
        ledger.push_back(record.clone());
        while ledger.len() > MAX_LEDGER_SIZE {
            ledger.pop_front();
        }
        record
    }

    /// Health fields only: last-triggered, last status, consecutive-failure
    /// count (reset on any success). The dispatcher never disables an
    /// endpoint on its own.
    async fn update_health(&self, id: &str, success: bool) {
        {
            let mut webhooks = self.webhooks.write().await;
            let Some(webhook) = webhooks.get_mut(id) else {
                return;
            };
            webhook.last_triggered_at = Some(Utc::now());
            if success {
                webhook.last_status = Some(DeliveryStatus::Success);
                webhook.failure_count = 0;
            } else {
                webhook.last_status = Some(DeliveryStatus::Failed);
                webhook.failure_count += 1;
            }
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let webhooks: Vec<Webhook> = self.webhooks.read().await.values().cloned().collect();
        if let Err(err) = self.store.save(&webhooks) {
            warn!(error = %err, "failed to persist webhooks");
        }
    }
}

/// `retry_delay * 2^attempt`, zero-indexed.
fn backoff_delay(retry_delay_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(retry_delay_ms.saturating_mul(1u64 << attempt.min(16)))
}

/// `sha256=<hex hmac>` over the exact serialized body.
fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(250, 3), Duration::from_millis(2000));
    }

    #[test]
    fn signature_matches_known_vector() {
        // RFC 4231-style vector: HMAC-SHA256("key", "The quick brown fox ...").
        let sig = sign("key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_is_deterministic_for_same_body() {
        let body = r#"{"id":"abc","event":{"type":"service:stopped"}}"#;
        assert_eq!(sign("s3cret", body), sign("s3cret", body));
        assert_ne!(sign("s3cret", body), sign("other", body));
    }
}
