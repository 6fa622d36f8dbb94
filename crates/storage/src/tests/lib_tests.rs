use super::*;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use shared::domain::{Author, Message, MessageId, Session, SessionId};

fn sample_session(id: &str) -> Session {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().expect("time");
    let mut session = Session::with_id(SessionId::from(id), "Session 1", at);
    session
        .messages
        .push(Message::new(MessageId::from("m-1"), Author::user(), "hello", at));
    session
}

struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(anyhow::anyhow!("disk unavailable"))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(anyhow::anyhow!("disk full"))
    }
}

#[tokio::test]
async fn memory_store_overwrites_values() {
    let store = MemoryStore::new();
    assert_eq!(store.get("k").await.expect("get"), None);
    store.set("k", "one").await.expect("set");
    store.set("k", "two").await.expect("set");
    assert_eq!(store.get("k").await.expect("get").as_deref(), Some("two"));
}

#[tokio::test]
async fn sqlite_store_upserts_by_key() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
    store.set("sessions", "[]").await.expect("set");
    store.set("sessions", "[1]").await.expect("upsert");
    assert_eq!(
        store.get("sessions").await.expect("get").as_deref(),
        Some("[1]")
    );
    assert_eq!(store.get("missing").await.expect("get"), None);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = SqliteStore::new(&database_url).await.expect("db");
    store.set("k", "v").await.expect("set");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn cache_round_trips_sessions() {
    let cache = SessionCache::new(Arc::new(MemoryStore::new()), "chat-sessions");
    let sessions = vec![sample_session("a"), sample_session("b")];
    assert!(cache.save(&sessions).await);
    assert_eq!(cache.load().await, sessions);
}

#[tokio::test]
async fn cache_drops_malformed_entries_individually() {
    let good = serde_json::to_value(sample_session("good")).expect("encode");
    let raw = serde_json::json!([good, {"id": 5}, "junk", null]).to_string();
    let cache = SessionCache::new(Arc::new(MemoryStore::with_entry("k", raw)), "k");

    let loaded = cache.load().await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, SessionId::from("good"));
}

#[tokio::test]
async fn cache_treats_garbage_as_empty() {
    let cache = SessionCache::new(Arc::new(MemoryStore::with_entry("k", "{not json")), "k");
    assert!(cache.load().await.is_empty());

    let cache = SessionCache::new(Arc::new(MemoryStore::with_entry("k", "{\"a\":1}")), "k");
    assert!(cache.load().await.is_empty());
}

#[tokio::test]
async fn cache_failures_are_not_fatal() {
    let cache = SessionCache::new(Arc::new(FailingStore), "k");
    assert!(cache.load().await.is_empty());
    assert!(!cache.save(&[sample_session("a")]).await);
}

#[test]
fn memory_urls_have_no_file_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/cache.db?mode=rwc"),
        Some(PathBuf::from("./data/cache.db"))
    );
}
