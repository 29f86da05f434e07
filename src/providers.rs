//! Seams to the excluded collaborators: target discovery, webhook
//! persistence and token validation. The core only ever talks to these
//! traits; the implementations here are the narrow glue the binary wires in.

use crate::types::{Target, Webhook};
use crate::AgentError;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::warn;

/// "Give me the current set of supervised targets."
pub trait TargetProvider: Send + Sync {
    fn targets(&self) -> Vec<Target>;
}

/// "Persist/retrieve webhook definitions."
pub trait WebhookStore: Send + Sync {
    fn load(&self) -> Result<Vec<Webhook>, AgentError>;
    fn save(&self, webhooks: &[Webhook]) -> Result<(), AgentError>;
}

/// Bearer-token check performed before a realtime handshake completes.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Fixed target list loaded once at startup from the agent config.
pub struct StaticTargets {
    targets: Vec<Target>,
}

impl StaticTargets {
    pub fn new(targets: Vec<Target>) -> Self {
        StaticTargets { targets }
    }
}

impl TargetProvider for StaticTargets {
    fn targets(&self) -> Vec<Target> {
        self.targets.clone()
    }
}

/// Webhook registrations persisted as a JSON array on disk. A missing file
/// reads as an empty list.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

impl WebhookStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Webhook>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, webhooks: &[Webhook]) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(webhooks)?;
        // Write-then-rename so a crash mid-write never truncates the store.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %err, path = %self.path.display(), "store rename failed");
            return Err(err.into());
        }
        Ok(())
    }
}

/// Compares the sha256 of the presented token against the configured one, so
/// the plaintext never has to live past construction.
pub struct SharedSecretValidator {
    token_hash: String,
}

impl SharedSecretValidator {
    pub fn new(token: &str) -> Self {
        SharedSecretValidator {
            token_hash: sha256_hex(token),
        }
    }
}

impl TokenValidator for SharedSecretValidator {
    fn validate(&self, token: &str) -> bool {
        sha256_hex(token) == self.token_hash
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_accepts_only_the_configured_token() {
        let v = SharedSecretValidator::new("hunter2");
        assert!(v.validate("hunter2"));
        assert!(!v.validate("hunter3"));
        assert!(!v.validate(""));
    }

    #[test]
    fn missing_store_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("webhooks.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn store_round_trips_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("webhooks.json"));
        let webhook: Webhook = serde_json::from_str(
            r#"{
                "id": "w1",
                "name": "ops",
                "url": "http://example.invalid/hook",
                "createdAt": "2026-01-01T00:00:00Z",
                "updatedAt": "2026-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        store.save(&[webhook.clone()]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, webhook.id);
        assert_eq!(loaded[0].url, webhook.url);
    }
}
