use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
string_id_newtype!(SessionId);
string_id_newtype!(MessageId);

/// Prefix carried by optimistic messages until an authoritative copy replaces them.
pub const TEMP_MESSAGE_PREFIX: &str = "temp-";
/// Prefixes of ids minted locally for messages the server has not assigned an id to yet.
pub const LOCAL_MESSAGE_PREFIXES: &[&str] = &[TEMP_MESSAGE_PREFIX, "user-", "assistant-"];
pub const LOCAL_SESSION_PREFIX: &str = "local-";

/// Eight hex characters from a fresh v4 uuid.
pub fn short_random_suffix() -> String {
    let mut raw = Uuid::new_v4().simple().to_string();
    raw.truncate(8);
    raw
}

impl MessageId {
    pub fn temporary(at: DateTime<Utc>) -> Self {
        Self(format!(
            "{TEMP_MESSAGE_PREFIX}{}-{}",
            at.timestamp_millis(),
            short_random_suffix()
        ))
    }

    pub fn with_prefix(prefix: &str, at: DateTime<Utc>) -> Self {
        Self(format!(
            "{prefix}-{}-{}",
            at.timestamp_millis(),
            short_random_suffix()
        ))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_MESSAGE_PREFIX)
    }

    pub fn is_locally_minted(&self) -> bool {
        LOCAL_MESSAGE_PREFIXES
            .iter()
            .any(|prefix| self.0.starts_with(prefix))
    }
}

impl SessionId {
    pub fn new_local(at: DateTime<Utc>) -> Self {
        Self(format!(
            "{LOCAL_SESSION_PREFIX}{}-{}",
            at.timestamp_millis(),
            short_random_suffix()
        ))
    }

    /// Stable id for the direct conversation between two users, independent of who opened it.
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm-{}-{}", low.0, high.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Local,
    Remote,
}

/// Who wrote a message. The assistant surface only knows roles, the direct surface knows both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Author {
    Role {
        role: Role,
    },
    Direct {
        sender_id: UserId,
        receiver_id: UserId,
    },
}

/// Sender half of a message's content dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    Role(Role),
    User(UserId),
}

impl Author {
    pub fn user() -> Self {
        Self::Role { role: Role::User }
    }

    pub fn assistant() -> Self {
        Self::Role {
            role: Role::Assistant,
        }
    }

    pub fn sender(&self) -> Sender {
        match self {
            Self::Role { role } => Sender::Role(*role),
            Self::Direct { sender_id, .. } => Sender::User(*sender_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Message {
    pub fn new(
        id: MessageId,
        author: Author,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            author,
            content: content.into(),
            timestamp,
            pending: false,
            error: false,
            sources: Vec::new(),
        }
    }

    pub fn optimistic(author: Author, content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            pending: true,
            ..Self::new(MessageId::temporary(at), author, content, at)
        }
    }

    pub fn sender(&self) -> Sender {
        self.author.sender()
    }

    /// Pending, or confirmed locally but still carrying a locally minted id.
    pub fn is_provisional(&self) -> bool {
        self.pending || self.id.is_locally_minted()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: Origin,
}

impl Session {
    pub fn new_local(title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::with_id(SessionId::new_local(at), title, at)
    }

    pub fn with_id(id: SessionId, title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            remote_id: None,
            title: title.into(),
            messages: Vec::new(),
            created_at: at,
            updated_at: at,
            origin: Origin::Local,
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|message| message.timestamp)
    }

    pub fn pending_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| message.pending)
    }
}

pub fn default_session_title(index: usize) -> String {
    format!("Session {index}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Checking,
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceStatus {
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn checked(state: ServiceState, at: DateTime<Utc>) -> Self {
        Self {
            state,
            last_checked: Some(at),
            error: None,
        }
    }

    pub fn unreachable(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            state: ServiceState::Offline,
            last_checked: Some(at),
            error: Some(error.into()),
        }
    }
}
