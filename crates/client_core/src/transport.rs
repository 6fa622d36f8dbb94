//! Request/response collaborators of the conversation engine: history fetch, outbound send and
//! the liveness probe, with reqwest implementations for the assistant and direct surfaces.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response};
use serde_json::Value;
use shared::{
    domain::{Message, Origin, ServiceState, Session, SessionId, UserId},
    error::ApiError,
    protocol::{ChatRequest, SendDirectMessageRequest},
};
use tracing::{debug, info};

use crate::{
    error::TransportError,
    normalize::{assistant_reply, direct_messages, history_sessions, interpret_status, json_or_text, AssistantReply},
};

/// What the backend handed back for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The reply arrived on the same request (assistant surface).
    Reply(AssistantReply),
    /// The authoritative copy will arrive later through push or polling.
    Deferred,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Full known history, already normalized into sessions.
    async fn fetch_history(&self) -> Result<Vec<Session>, TransportError>;
}

#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, session: &Session, message: &Message) -> Result<Delivery, TransportError>;
}

#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self) -> Result<ServiceState, TransportError>;
}

pub struct MissingHistorySource;

#[async_trait]
impl HistorySource for MissingHistorySource {
    async fn fetch_history(&self) -> Result<Vec<Session>, TransportError> {
        Ok(Vec::new())
    }
}

pub struct MissingOutboundChannel;

#[async_trait]
impl OutboundChannel for MissingOutboundChannel {
    async fn send(&self, _session: &Session, _message: &Message) -> Result<Delivery, TransportError> {
        Err(TransportError::NotConfigured("outbound channel"))
    }
}

/// Reads the body of any response; non-2xx statuses become `TransportError::Status` carrying the
/// backend's own error text when it sent one.
async fn read_body(url: &str, response: Response) -> Result<Value, TransportError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| TransportError::request(url, err))?;
    let value = json_or_text(&body);
    if !status.is_success() {
        let message = ApiError::from_body(&value)
            .map(|err| err.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        return Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            message,
        });
    }
    Ok(value)
}

/// Assistant backend: `GET /history`, `POST /chat`, `GET /status`.
#[derive(Clone)]
pub struct AssistantApi {
    http: Client,
    base_url: String,
}

impl AssistantApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: crate::config::sanitize_base_url(&base_url.into()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl HistorySource for AssistantApi {
    async fn fetch_history(&self) -> Result<Vec<Session>, TransportError> {
        let url = self.url("history");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| TransportError::request(&url, err))?;
        let body = read_body(&url, response).await?;
        let sessions = history_sessions(&body, Utc::now());
        debug!(sessions = sessions.len(), "assistant: history fetched");
        Ok(sessions)
    }
}

#[async_trait]
impl OutboundChannel for AssistantApi {
    async fn send(&self, session: &Session, message: &Message) -> Result<Delivery, TransportError> {
        let url = self.url("chat");
        let request = ChatRequest {
            question: message.content.clone(),
            session_id: session
                .remote_id
                .clone()
                .unwrap_or_else(|| session.id.to_string()),
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::request(&url, err))?;
        let body = read_body(&url, response).await?;
        info!(session_id = %session.id, "assistant: reply received");
        Ok(Delivery::Reply(assistant_reply(&body)))
    }
}

#[async_trait]
impl StatusProbe for AssistantApi {
    async fn probe(&self) -> Result<ServiceState, TransportError> {
        let url = self.url("status");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| TransportError::request(&url, err))?;
        Ok(interpret_status(&read_body(&url, response).await?))
    }
}

/// Direct-message backend for one `(current user, peer)` pair.
#[derive(Clone)]
pub struct DirectChatApi {
    http: Client,
    server_url: String,
    current_user: UserId,
    peer: UserId,
}

impl DirectChatApi {
    pub fn new(server_url: impl Into<String>, current_user: UserId, peer: UserId) -> Self {
        Self {
            http: Client::new(),
            server_url: crate::config::sanitize_base_url(&server_url.into()),
            current_user,
            peer,
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::direct(self.current_user, self.peer)
    }
}

/// Title of the single session backing a direct conversation.
pub fn direct_session_title(peer: UserId) -> String {
    format!("Conversation with user {peer}")
}

#[async_trait]
impl HistorySource for DirectChatApi {
    /// The conversation as one remote session, or nothing when no message has been exchanged yet.
    async fn fetch_history(&self) -> Result<Vec<Session>, TransportError> {
        let url = format!("{}/user-chat/conversation", self.server_url);
        let response = self
            .http
            .get(&url)
            .query(&[("user1", self.current_user.0), ("user2", self.peer.0)])
            .send()
            .await
            .map_err(|err| TransportError::request(&url, err))?;
        let messages = direct_messages(&read_body(&url, response).await?);
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok(Vec::new());
        };

        let id = self.session_id();
        let mut session = Session::with_id(id.clone(), direct_session_title(self.peer), first.timestamp);
        session.updated_at = last.timestamp;
        session.remote_id = Some(id.to_string());
        session.origin = Origin::Remote;
        session.messages = messages;
        Ok(vec![session])
    }
}

#[async_trait]
impl OutboundChannel for DirectChatApi {
    async fn send(&self, _session: &Session, message: &Message) -> Result<Delivery, TransportError> {
        let url = format!("{}/user-chat/send", self.server_url);
        let request = SendDirectMessageRequest {
            sender_id: self.current_user,
            receiver_id: self.peer,
            content: message.content.clone(),
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::request(&url, err))?;
        read_body(&url, response).await?;
        info!(
            sender_id = self.current_user.0,
            receiver_id = self.peer.0,
            "direct: message accepted"
        );
        Ok(Delivery::Deferred)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
