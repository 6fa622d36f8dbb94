use std::{fs, path::Path, time::Duration};

use tracing::warn;

use crate::reconcile::DedupPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "chat_engine.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// REST base for the direct surface, e.g. `https://host/api`.
    pub server_url: String,
    /// Push hub endpoint, e.g. `https://host/chatHub`.
    pub push_url: String,
    pub assistant_base_url: String,
    pub database_url: String,
    pub storage_key: String,
    pub poll_interval: Duration,
    pub push_health_reset: Duration,
    pub status_interval: Duration,
    pub optimistic_cleanup: Duration,
    pub content_time_window_ms: i64,
    pub push_retry_delays: Vec<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:7031/api".into(),
            push_url: "http://127.0.0.1:7031/chatHub".into(),
            assistant_base_url: "http://127.0.0.1:8000".into(),
            database_url: "sqlite://./data/chat_engine.db".into(),
            storage_key: "conversation-sessions".into(),
            poll_interval: Duration::from_secs(3),
            push_health_reset: Duration::from_secs(10),
            status_interval: Duration::from_secs(60),
            optimistic_cleanup: Duration::from_secs(2),
            content_time_window_ms: 1_000,
            push_retry_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

impl EngineConfig {
    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::new(self.content_time_window_ms)
    }
}

/// Defaults, then `chat_engine.toml` in the working directory, then environment variables.
pub fn load_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Ok(raw) = fs::read_to_string(DEFAULT_CONFIG_FILE) {
        apply_file(&mut config, &raw);
    }
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

pub fn load_config_from(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = fs::read_to_string(path)?;
    let mut config = EngineConfig::default();
    apply_file(&mut config, &raw);
    Ok(config)
}

fn apply_file(config: &mut EngineConfig, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!("config: ignoring unreadable {DEFAULT_CONFIG_FILE}: {err}");
            return;
        }
    };

    let text = |key: &str| table.get(key).and_then(|value| value.as_str()).map(str::to_string);
    let millis = |key: &str| {
        table
            .get(key)
            .and_then(|value| value.as_integer())
            .and_then(|value| u64::try_from(value).ok())
            .map(Duration::from_millis)
    };

    if let Some(v) = text("server_url") {
        config.server_url = sanitize_base_url(&v);
    }
    if let Some(v) = text("push_url") {
        config.push_url = sanitize_base_url(&v);
    }
    if let Some(v) = text("assistant_base_url") {
        config.assistant_base_url = sanitize_base_url(&v);
    }
    if let Some(v) = text("database_url") {
        config.database_url = v;
    }
    if let Some(v) = text("storage_key") {
        config.storage_key = v;
    }
    if let Some(v) = millis("poll_interval_ms") {
        config.poll_interval = v;
    }
    if let Some(v) = millis("push_health_reset_ms") {
        config.push_health_reset = v;
    }
    if let Some(v) = millis("status_interval_ms") {
        config.status_interval = v;
    }
    if let Some(v) = millis("optimistic_cleanup_ms") {
        config.optimistic_cleanup = v;
    }
    if let Some(v) = table
        .get("content_time_window_ms")
        .and_then(|value| value.as_integer())
    {
        config.content_time_window_ms = v.max(0);
    }
}

/// Environment layer; `lookup` is injected so tests do not touch the process environment.
pub fn apply_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    let first = |keys: &[&str]| keys.iter().rev().find_map(|key| lookup(key));
    let millis = |keys: &[&str]| {
        first(keys)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    };

    if let Some(v) = first(&["CHAT_SERVER_URL", "APP__SERVER_URL"]) {
        config.server_url = sanitize_base_url(&v);
    }
    if let Some(v) = first(&["CHAT_PUSH_URL", "APP__PUSH_URL"]) {
        config.push_url = sanitize_base_url(&v);
    }
    if let Some(v) = first(&["CHAT_ASSISTANT_BASE_URL", "APP__ASSISTANT_BASE_URL"]) {
        config.assistant_base_url = sanitize_base_url(&v);
    }
    if let Some(v) = first(&["CHAT_DATABASE_URL", "APP__DATABASE_URL"]) {
        config.database_url = v;
    }
    if let Some(v) = first(&["APP__STORAGE_KEY"]) {
        config.storage_key = v;
    }
    if let Some(v) = millis(&["APP__POLL_INTERVAL_MS"]) {
        config.poll_interval = v;
    }
    if let Some(v) = millis(&["APP__PUSH_HEALTH_RESET_MS"]) {
        config.push_health_reset = v;
    }
    if let Some(v) = millis(&["APP__STATUS_INTERVAL_MS"]) {
        config.status_interval = v;
    }
    if let Some(v) = millis(&["APP__OPTIMISTIC_CLEANUP_MS"]) {
        config.optimistic_cleanup = v;
    }
    if let Some(v) = first(&["APP__CONTENT_TIME_WINDOW_MS"]).and_then(|raw| raw.trim().parse::<i64>().ok()) {
        config.content_time_window_ms = v.max(0);
    }
}

pub fn sanitize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
