//! Optimistic send: the placeholder goes into the session list before the network call, and is
//! later promoted, replaced or purged.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::domain::{default_session_title, Author, Message, MessageId, Session, SessionId};
use tracing::{info, warn};

use crate::{
    error::DispatchError,
    normalize::AssistantReply,
    reconcile::sort_sessions,
    transport::{Delivery, OutboundChannel},
};

/// Result of placing an optimistic message.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticSend {
    pub sessions: Vec<Session>,
    pub session_id: SessionId,
    pub message: Message,
    /// Whether a new local session had to be created to hold the message.
    pub created_session: bool,
}

/// Appends a pending message to the active session, creating a local session first when none is
/// active. Content is trimmed; blank content is rejected before anything changes.
pub fn begin_send(
    sessions: &[Session],
    active: Option<&SessionId>,
    author: Author,
    content: &str,
    now: DateTime<Utc>,
) -> Result<OptimisticSend, DispatchError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(DispatchError::EmptyContent);
    }

    let mut next = sessions.to_vec();
    let (session_id, created_session) = match active {
        Some(id) if next.iter().any(|session| &session.id == id) => (id.clone(), false),
        Some(id) => return Err(DispatchError::UnknownSession(id.clone())),
        None => {
            let session = Session::new_local(default_session_title(next.len() + 1), now);
            let id = session.id.clone();
            next.insert(0, session);
            (id, true)
        }
    };

    let message = Message::optimistic(author, content, now);
    if let Some(session) = next.iter_mut().find(|session| session.id == session_id) {
        session.messages.push(message.clone());
        session.updated_at = session.updated_at.max(now);
    }
    sort_sessions(&mut next);

    Ok(OptimisticSend {
        sessions: next,
        session_id,
        message,
        created_session,
    })
}

/// Assistant surface: the request itself confirmed the question, so the placeholder is promoted
/// and the reply appended as a confirmed assistant message.
pub fn complete_with_reply(
    sessions: &[Session],
    session_id: &SessionId,
    placeholder: &MessageId,
    reply: &AssistantReply,
    now: DateTime<Utc>,
) -> Vec<Session> {
    let mut next = sessions.to_vec();
    let Some(session) = next.iter_mut().find(|session| &session.id == session_id) else {
        return next;
    };

    if let Some(question) = session
        .messages
        .iter_mut()
        .find(|message| &message.id == placeholder)
    {
        question.id = MessageId::with_prefix("user", question.timestamp);
        question.pending = false;
    }
    let mut answer = Message::new(
        MessageId::with_prefix("assistant", now),
        Author::assistant(),
        reply.answer.clone(),
        now,
    );
    answer.sources = reply.sources.clone();
    session.messages.push(answer);
    session.updated_at = session.updated_at.max(now);

    sort_sessions(&mut next);
    next
}

/// Removes one message; `None` when it is no longer there.
pub fn remove_message(
    sessions: &[Session],
    session_id: &SessionId,
    message_id: &MessageId,
) -> Option<Vec<Session>> {
    let position = sessions.iter().position(|session| &session.id == session_id)?;
    if sessions[position].message(message_id).is_none() {
        return None;
    }

    let mut next = sessions.to_vec();
    next[position]
        .messages
        .retain(|message| &message.id != message_id);
    Some(next)
}

/// Issues outbound sends and knows how long a deferred placeholder may linger.
#[derive(Clone)]
pub struct Dispatcher {
    outbound: Arc<dyn OutboundChannel>,
    cleanup_after: Duration,
}

impl Dispatcher {
    pub fn new(outbound: Arc<dyn OutboundChannel>, cleanup_after: Duration) -> Self {
        Self {
            outbound,
            cleanup_after,
        }
    }

    /// Delay after which a deferred placeholder is purged if it is still present.
    pub fn cleanup_after(&self) -> Duration {
        self.cleanup_after
    }

    pub async fn deliver(&self, session: &Session, message: &Message) -> Result<Delivery, DispatchError> {
        match self.outbound.send(session, message).await {
            Ok(delivery) => {
                info!(
                    session_id = %session.id,
                    message_id = %message.id,
                    deferred = matches!(delivery, Delivery::Deferred),
                    "dispatch: send accepted"
                );
                Ok(delivery)
            }
            Err(err) => {
                warn!(session_id = %session.id, message_id = %message.id, "dispatch: send failed: {err}");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
