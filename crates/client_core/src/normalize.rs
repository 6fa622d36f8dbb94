//! Folding loosely shaped backend payloads into domain sessions and messages.
//!
//! Nothing here fails: entries that cannot be read are skipped, and unreadable payloads
//! normalize to empty results.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::{
    domain::{
        default_session_title, Author, Message, MessageId, Origin, Role,
        ServiceState, Session, SessionId,
    },
    protocol::{timestamp_from_value, DirectMessagePayload},
};

pub const EMPTY_ANSWER_FALLBACK: &str = "The assistant did not return an answer.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    pub answer: String,
    pub sources: Vec<String>,
}

/// JSON when the body parses, otherwise the raw text as a JSON string.
pub fn json_or_text(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn first_field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

fn first_text(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|value| value.as_str().filter(|text| !text.is_empty()))
        .map(str::to_string)
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.is_empty() => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn first_identifier(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(identifier)
}

fn first_timestamp(fields: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(timestamp_from_value)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Stable id for a history message the backend sent without one, so repeated fetches of the
/// same history produce the same ids.
fn positional_id(prefix: &str, session_key: &str, position: usize) -> MessageId {
    MessageId(format!("{prefix}-{session_key}-{position}"))
}

/// Keeps the first occurrence of every message id.
fn unique_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|message| seen.insert(message.id.clone()))
        .collect()
}

/// Reads one assistant-surface message; the fallbacks stand in for a missing id or timestamp.
pub fn message_from_value(
    value: &Value,
    fallback_id: impl FnOnce() -> MessageId,
    fallback_at: DateTime<Utc>,
) -> Option<Message> {
    let fields = value.as_object()?;
    let role = match first_text(fields, &["role", "sender"]).as_deref() {
        Some("assistant") | Some("ai") => Role::Assistant,
        _ => Role::User,
    };
    let content = first_text(fields, &["text", "content"]).unwrap_or_default();
    let id = first_identifier(fields, &["id"])
        .map(MessageId)
        .unwrap_or_else(fallback_id);
    let timestamp = first_timestamp(fields, &["timestamp", "ts"]).unwrap_or(fallback_at);

    Some(Message {
        id,
        author: Author::Role { role },
        content,
        timestamp,
        pending: truthy(fields.get("pending")),
        error: truthy(fields.get("error")),
        sources: string_list(fields.get("sources")),
    })
}

/// History payload: a bare array, `{history: [...]}` or `{sessions: [...]}`.
fn history_entries(payload: &Value) -> &[Value] {
    match payload {
        Value::Array(entries) => entries,
        Value::Object(fields) => ["history", "sessions"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

struct HistoryGroup {
    session: Session,
    entries: usize,
}

/// Groups history entries into remote sessions. Entries sharing a session id are folded into
/// one session in payload order; each entry either carries a `messages` array or a flat
/// question/answer pair.
pub fn history_sessions(payload: &Value, now: DateTime<Utc>) -> Vec<Session> {
    let mut groups: Vec<HistoryGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in history_entries(payload) {
        let Some(fields) = entry.as_object() else {
            continue;
        };

        let key = first_identifier(fields, &["sessionId", "session_id", "id", "session"])
            .unwrap_or_else(|| format!("remote-{}", groups.len() + 1));
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            let title = default_session_title(groups.len() + 1);
            let mut session = Session::with_id(SessionId(key.clone()), title, now);
            session.remote_id = Some(key.clone());
            session.origin = Origin::Remote;
            groups.push(HistoryGroup {
                session,
                entries: 0,
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        let first_entry = group.entries == 0;
        group.entries += 1;

        let entry_created = first_timestamp(fields, &["created_at", "createdAt"]);
        let entry_updated = first_timestamp(fields, &["updated_at", "updatedAt"]);
        let entry_stamp = first_timestamp(fields, &["timestamp"]);
        let first_new = group.session.messages.len();

        if let Some(messages) = fields.get("messages").and_then(Value::as_array) {
            let fallback_at = entry_created.unwrap_or(now);
            for message in messages {
                let position = group.session.messages.len();
                let fallback_id = || positional_id("msg", &key, position);
                if let Some(message) = message_from_value(message, fallback_id, fallback_at) {
                    push_unique(&mut group.session, message);
                }
            }
        } else {
            if let Some(question) = first_text(fields, &["question"]) {
                let id = first_identifier(fields, &["questionId"])
                    .map(MessageId)
                    .unwrap_or_else(|| positional_id("q", &key, group.session.messages.len()));
                let at = entry_created.or(entry_stamp).unwrap_or(now);
                push_unique(
                    &mut group.session,
                    Message::new(id, Author::user(), question, at),
                );
            }
            if let Some(answer) = first_text(fields, &["answer", "response"]) {
                let id = first_identifier(fields, &["answerId"])
                    .map(MessageId)
                    .unwrap_or_else(|| positional_id("a", &key, group.session.messages.len()));
                let at = entry_updated.or(entry_stamp).unwrap_or(now);
                let mut message = Message::new(id, Author::assistant(), answer, at);
                message.sources = string_list(fields.get("sources"));
                push_unique(&mut group.session, message);
            }
        }

        let added = &group.session.messages[first_new..];
        let created = entry_created
            .or_else(|| added.first().map(|message| message.timestamp))
            .unwrap_or(group.session.created_at);
        if first_entry || created < group.session.created_at {
            group.session.created_at = created;
        }
        let updated = entry_updated
            .or_else(|| added.last().map(|message| message.timestamp))
            .unwrap_or(created);
        if first_entry || updated > group.session.updated_at {
            group.session.updated_at = updated;
        }

        if let Some(title) = first_text(fields, &["title"]) {
            let title = title.trim();
            if !title.is_empty() {
                group.session.title = title.to_string();
            }
        }
    }

    groups.into_iter().map(|group| group.session).collect()
}

/// Message ids stay unique within a session; the first occurrence wins.
fn push_unique(session: &mut Session, message: Message) {
    if session.message(&message.id).is_none() {
        session.messages.push(message);
    }
}

/// Direct conversation payload: a bare array or `{data: [...]}`.
pub fn direct_messages(payload: &Value) -> Vec<Message> {
    let entries = match payload {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(fields) => fields
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    unique_by_id(
        entries
            .iter()
            .filter_map(|entry| serde_json::from_value::<DirectMessagePayload>(entry.clone()).ok())
            .map(Message::from)
            .collect(),
    )
}

/// Chat completion body: a JSON object carrying `answer|response|content|data`, or plain text.
pub fn assistant_reply(body: &Value) -> AssistantReply {
    let (answer, sources) = match body {
        Value::String(text) => (Some(text.clone()), Vec::new()),
        Value::Object(fields) => (
            first_text(fields, &["answer", "response", "content", "data"]),
            string_list(fields.get("sources")),
        ),
        _ => (None, Vec::new()),
    };
    AssistantReply {
        answer: answer
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| EMPTY_ANSWER_FALLBACK.to_string()),
        sources,
    }
}

const ONLINE_WORDS: &[&str] = &["ok", "ready", "running", "online", "healthy"];
const OFFLINE_WORDS: &[&str] = &["offline", "error", "failed", "unhealthy"];

/// Reduces a free-form status payload to online, offline or unknown.
pub fn interpret_status(payload: &Value) -> ServiceState {
    let raw = match payload {
        Value::String(text) => text.clone(),
        Value::Object(fields) => first_field(fields, &["status", "state", "message"])
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        _ => String::new(),
    };
    let normalized = raw.trim().to_lowercase();

    if ONLINE_WORDS.contains(&normalized.as_str()) {
        ServiceState::Online
    } else if OFFLINE_WORDS.contains(&normalized.as_str()) {
        ServiceState::Offline
    } else {
        ServiceState::Unknown
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
