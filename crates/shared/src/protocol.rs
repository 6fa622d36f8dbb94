use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{Author, Message, MessageId, UserId};

/// `POST {base}/chat` body on the assistant surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    pub session_id: String,
}

/// `POST /user-chat/send` body on the direct surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDirectMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// One entry of `GET /user-chat/conversation`, also the `ReceiveMessage` push payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePayload {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl From<DirectMessagePayload> for Message {
    fn from(payload: DirectMessagePayload) -> Self {
        Message::new(
            MessageId(payload.id),
            Author::Direct {
                sender_id: payload.sender_id,
                receiver_id: payload.receiver_id,
            },
            payload.content,
            payload.timestamp,
        )
    }
}

/// Accepts RFC 3339 as well as the offset-less form some backends emit (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Reads a timestamp from a JSON string or from epoch milliseconds.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    timestamp_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {value}")))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(raw) => Ok(raw),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Push hub wire format: JSON records terminated by the ASCII record separator.
pub mod hub {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    pub const RECORD_SEPARATOR: char = '\u{1e}';
    pub const RECEIVE_MESSAGE_TARGET: &str = "ReceiveMessage";

    pub const INVOCATION: u8 = 1;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HandshakeRequest {
        pub protocol: String,
        pub version: u32,
    }

    impl Default for HandshakeRequest {
        fn default() -> Self {
            Self {
                protocol: "json".into(),
                version: 1,
            }
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct HandshakeResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HubFrame {
        #[serde(rename = "type")]
        pub kind: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub target: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub arguments: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    impl HubFrame {
        pub fn ping() -> Self {
            Self {
                kind: PING,
                target: None,
                arguments: Vec::new(),
                error: None,
            }
        }

        pub fn invocation(target: &str, arguments: Vec<Value>) -> Self {
            Self {
                kind: INVOCATION,
                target: Some(target.to_string()),
                arguments,
                error: None,
            }
        }
    }

    /// Serializes one record including its terminator.
    pub fn encode_record<T: Serialize>(record: &T) -> serde_json::Result<String> {
        let mut text = serde_json::to_string(record)?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }

    /// Splits a text frame into its non-empty records.
    pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
        text.split(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
    }
}
