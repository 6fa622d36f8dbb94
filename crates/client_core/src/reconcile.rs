//! History reconciliation between the locally held session list and server views of it.
//!
//! Every function here is pure: it takes the current list and returns a new one. Callers own
//! persisting the result.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use shared::domain::{Message, MessageId, Session, SessionId};

/// Identity rule used to decide that two message records are the same logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    content_time_window: Duration,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl DedupPolicy {
    pub fn new(content_time_window_ms: i64) -> Self {
        Self {
            content_time_window: Duration::milliseconds(content_time_window_ms.max(0)),
        }
    }

    pub fn content_time_window(&self) -> Duration {
        self.content_time_window
    }

    /// Same id, or same sender and content with timestamps inside the window.
    pub fn same_message(&self, a: &Message, b: &Message) -> bool {
        a.id == b.id || self.same_content(a, b)
    }

    fn same_content(&self, a: &Message, b: &Message) -> bool {
        a.sender() == b.sender()
            && a.content == b.content
            && (a.timestamp - b.timestamp).abs() <= self.content_time_window
    }

    /// Whether `authoritative` stands for the provisional `local` copy.
    pub fn confirms(&self, local: &Message, authoritative: &Message) -> bool {
        local.is_provisional()
            && !authoritative.is_provisional()
            && self.same_message(local, authoritative)
    }
}

/// Most recently updated first. The sort is stable, so ties keep their relative order.
pub fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Merges a fetched session list into the local one.
///
/// The incoming copy is authoritative for every message id it knows; local messages the server
/// has not seen yet are kept after it. Local sessions the fetch did not return are carried over
/// unchanged. The result is ordered by `updated_at`, newest first.
pub fn merge_sessions(existing: &[Session], incoming: &[Session]) -> Vec<Session> {
    if incoming.is_empty() {
        return existing.to_vec();
    }

    let existing_by_id: HashMap<&SessionId, &Session> =
        existing.iter().map(|session| (&session.id, session)).collect();
    let incoming_ids: HashSet<&SessionId> = incoming.iter().map(|session| &session.id).collect();

    let mut merged: Vec<Session> = incoming
        .iter()
        .map(|remote| match existing_by_id.get(&remote.id) {
            None => remote.clone(),
            Some(local) => merge_pair(local, remote),
        })
        .collect();
    merged.extend(
        existing
            .iter()
            .filter(|session| !incoming_ids.contains(&session.id))
            .cloned(),
    );
    sort_sessions(&mut merged);
    merged
}

fn merge_pair(local: &Session, remote: &Session) -> Session {
    let known: HashSet<&MessageId> = remote.messages.iter().map(|message| &message.id).collect();
    let mut messages = remote.messages.clone();
    messages.extend(
        local
            .messages
            .iter()
            .filter(|message| !known.contains(&message.id))
            .cloned(),
    );
    let mut merged = Session {
        messages,
        ..remote.clone()
    };
    merged.updated_at = merged
        .last_message_at()
        .map_or(remote.updated_at, |last| last.max(remote.updated_at));
    merged
}

/// First provisional message `authoritative` stands for, skipping slots already claimed by
/// another authoritative copy. Both the fetch path and the live path match through here, so one
/// server message settles at most one placeholder either way.
fn confirmable_slot(
    messages: &[Message],
    authoritative: &Message,
    claimed: &HashSet<usize>,
    policy: &DedupPolicy,
) -> Option<usize> {
    messages
        .iter()
        .enumerate()
        .find(|(slot, candidate)| !claimed.contains(slot) && policy.confirms(candidate, authoritative))
        .map(|(slot, _)| slot)
}

/// Drops provisional messages that a server-assigned message in the same session now stands for.
///
/// Matching is one-to-one. Server messages listed in `already_applied` were present before this
/// fetch and have settled their placeholder already, so they confirm nothing new.
pub fn settle_optimistic(
    session: &Session,
    already_applied: &HashSet<&MessageId>,
    policy: &DedupPolicy,
) -> Session {
    let mut claimed = HashSet::new();
    for authoritative in &session.messages {
        if authoritative.is_provisional() || already_applied.contains(&authoritative.id) {
            continue;
        }
        if let Some(slot) = confirmable_slot(&session.messages, authoritative, &claimed, policy) {
            claimed.insert(slot);
        }
    }
    let messages = session
        .messages
        .iter()
        .enumerate()
        .filter(|(slot, _)| !claimed.contains(slot))
        .map(|(_, message)| message.clone())
        .collect();
    Session {
        messages,
        ..session.clone()
    }
}

/// The single path every fetched history goes through: merge, then settle optimistic copies in
/// the sessions the fetch touched.
pub fn reconcile(existing: &[Session], incoming: &[Session], policy: &DedupPolicy) -> Vec<Session> {
    if incoming.is_empty() {
        return existing.to_vec();
    }
    let touched: HashSet<&SessionId> = incoming.iter().map(|session| &session.id).collect();
    let settled_before: HashMap<&SessionId, HashSet<&MessageId>> = existing
        .iter()
        .filter(|session| touched.contains(&session.id))
        .map(|session| {
            let ids = session
                .messages
                .iter()
                .filter(|message| !message.is_provisional())
                .map(|message| &message.id)
                .collect();
            (&session.id, ids)
        })
        .collect();
    let nothing_applied = HashSet::new();

    merge_sessions(existing, incoming)
        .into_iter()
        .map(|session| {
            if touched.contains(&session.id) {
                let already_applied = settled_before.get(&session.id).unwrap_or(&nothing_applied);
                settle_optimistic(&session, already_applied, policy)
            } else {
                session
            }
        })
        .collect()
}

/// Outcome of applying one live message to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveApply {
    Appended,
    /// An optimistic placeholder was swapped for the authoritative copy in place.
    Confirmed,
    /// A copy with the same id was already present; it was refreshed in place.
    Refreshed,
    UnknownSession,
}

/// Applies a message delivered outside a history fetch (push channel).
pub fn apply_live_message(
    sessions: &[Session],
    session_id: &SessionId,
    message: Message,
    policy: &DedupPolicy,
) -> (Vec<Session>, LiveApply) {
    let Some(position) = sessions.iter().position(|session| &session.id == session_id) else {
        return (sessions.to_vec(), LiveApply::UnknownSession);
    };

    let mut next = sessions.to_vec();
    let session = &mut next[position];
    let outcome = if let Some(slot) = session.messages.iter().position(|m| m.id == message.id) {
        session.messages[slot] = message.clone();
        LiveApply::Refreshed
    } else if let Some(slot) = confirmable_slot(&session.messages, &message, &HashSet::new(), policy) {
        session.messages[slot] = message.clone();
        LiveApply::Confirmed
    } else {
        session.messages.push(message.clone());
        LiveApply::Appended
    };
    session.updated_at = session.updated_at.max(message.timestamp);
    sort_sessions(&mut next);
    (next, outcome)
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
