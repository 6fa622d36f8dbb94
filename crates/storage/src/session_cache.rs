use std::sync::Arc;

use serde_json::Value;
use shared::domain::Session;
use tracing::{debug, warn};

use crate::KeyValueStore;

/// Durable snapshot of one client's sessions, stored as a single JSON array under a fixed key.
///
/// Reads and writes are best-effort: failures are logged and never reach the caller as errors.
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl SessionCache {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Entries that do not decode as a session are dropped individually.
    pub async fn load(&self) -> Vec<Session> {
        let raw = match self.store.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(key = %self.key, "session cache: unable to read stored sessions: {err:#}");
                return Vec::new();
            }
        };

        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                warn!(key = %self.key, "session cache: stored value is not an array; ignoring it");
                return Vec::new();
            }
            Err(err) => {
                warn!(key = %self.key, "session cache: stored value is not JSON: {err}");
                return Vec::new();
            }
        };

        let total = entries.len();
        let sessions: Vec<Session> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if sessions.len() != total {
            warn!(
                key = %self.key,
                dropped = total - sessions.len(),
                "session cache: dropped malformed session entries"
            );
        }
        sessions
    }

    /// Replaces the whole snapshot. Returns whether the write landed.
    pub async fn save(&self, sessions: &[Session]) -> bool {
        let raw = match serde_json::to_string(sessions) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %self.key, "session cache: unable to serialize sessions: {err}");
                return false;
            }
        };
        match self.store.set(&self.key, &raw).await {
            Ok(()) => {
                debug!(key = %self.key, sessions = sessions.len(), "session cache: snapshot written");
                true
            }
            Err(err) => {
                warn!(key = %self.key, "session cache: unable to persist sessions: {err:#}");
                false
            }
        }
    }
}
