use chrono::{DateTime, Utc};
use shared::domain::{Message, Origin, ServiceStatus, Session, SessionId};

use crate::push::PushState;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub pending: usize,
    pub origin: Origin,
    /// Last message content, for list previews.
    pub preview: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            updated_at: session.updated_at,
            message_count: session.messages.len(),
            pending: session.pending_messages().count(),
            origin: session.origin,
            preview: session.messages.last().map(|message| message.content.clone()),
        }
    }
}

/// Everything a front end renders for one conversation surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub sessions: Vec<SessionSummary>,
    pub active_session: Option<SessionId>,
    pub messages: Vec<Message>,
    pub loading: bool,
    /// Send or manual refresh failure shown to the user.
    pub last_error: Option<String>,
    /// Soft indicator for background fetch failures.
    pub sync_error: Option<String>,
    pub status: ServiceStatus,
    pub push_state: Option<PushState>,
}

/// The session to show: the requested one when it still exists, otherwise the most recent.
pub fn resolve_active<'a>(sessions: &'a [Session], requested: Option<&SessionId>) -> Option<&'a Session> {
    requested
        .and_then(|id| sessions.iter().find(|session| &session.id == id))
        .or_else(|| sessions.first())
}

#[derive(Debug, Clone, Default)]
pub struct ViewFlags {
    pub loading: bool,
    pub last_error: Option<String>,
    pub sync_error: Option<String>,
    pub status: ServiceStatus,
    pub push_state: Option<PushState>,
}

impl ConversationView {
    pub fn derive(sessions: &[Session], active: Option<&SessionId>, flags: ViewFlags) -> Self {
        let active = resolve_active(sessions, active);
        Self {
            sessions: sessions.iter().map(SessionSummary::from).collect(),
            active_session: active.map(|session| session.id.clone()),
            messages: active.map(|session| session.messages.clone()).unwrap_or_default(),
            loading: flags.loading,
            last_error: flags.last_error,
            sync_error: flags.sync_error,
            status: flags.status,
            push_state: flags.push_state,
        }
    }

    pub fn active_summary(&self) -> Option<&SessionSummary> {
        let active = self.active_session.as_ref()?;
        self.sessions.iter().find(|summary| &summary.id == active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::Author;

    #[test]
    fn falls_back_to_most_recent_session() {
        let now = Utc::now();
        let mut newest = Session::new_local("Session 2", now);
        newest
            .messages
            .push(Message::optimistic(Author::user(), "draft", now));
        let older = Session::new_local("Session 1", now - chrono::Duration::hours(1));
        let sessions = vec![newest.clone(), older.clone()];

        let view = ConversationView::derive(&sessions, Some(&SessionId::from("gone")), ViewFlags::default());
        assert_eq!(view.active_session, Some(newest.id.clone()));
        assert_eq!(view.messages.len(), 1);
        let summary = view.active_summary().expect("summary");
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.preview.as_deref(), Some("draft"));

        let view = ConversationView::derive(&sessions, Some(&older.id), ViewFlags::default());
        assert_eq!(view.active_session, Some(older.id));
        assert!(view.messages.is_empty());
    }

    #[test]
    fn empty_list_has_no_active_session() {
        let view = ConversationView::derive(&[], None, ViewFlags::default());
        assert!(view.active_session.is_none());
        assert!(view.active_summary().is_none());
    }
}
