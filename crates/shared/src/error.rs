use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error body returned by the chat backends, reduced to a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Picks `message`, then `error`, then a plain-text body; `None` when nothing readable is present.
    pub fn from_body(body: &Value) -> Option<Self> {
        match body {
            Value::String(text) if !text.trim().is_empty() => Some(Self::new(text.trim())),
            Value::Object(fields) => ["message", "error", "title"]
                .iter()
                .filter_map(|key| fields.get(*key))
                .find_map(|value| value.as_str().filter(|text| !text.trim().is_empty()))
                .map(|text| Self::new(text.trim())),
            _ => None,
        }
    }
}
