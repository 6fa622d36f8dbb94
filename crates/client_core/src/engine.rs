//! The conversation engine: owns the session list for one surface and routes every change to it
//! through the reconciler or the dispatcher, persisting each committed list to the cache.

use std::{
    future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, Weak,
    },
};

use chrono::Utc;
use shared::domain::{
    default_session_title, Author, Message, MessageId, ServiceStatus, Session, SessionId, UserId,
};
use storage::{KeyValueStore, SessionCache};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    dispatcher::{begin_send, complete_with_reply, remove_message, Dispatcher},
    error::{DispatchError, TransportError},
    polling::{PollDecision, PollingFallbackController},
    push::{ConversationKey, PushChannelClient, PushListener, PushState, SubscriptionId},
    reconcile::{apply_live_message, reconcile, sort_sessions, DedupPolicy},
    scheduler::Scheduler,
    status::check_status,
    transport::{
        direct_session_title, Delivery, HistorySource, MissingHistorySource, MissingOutboundChannel,
        OutboundChannel, StatusProbe,
    },
    view_model::{ConversationView, ViewFlags},
};

/// Which chat surface an engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Many sessions, replies returned on the send request.
    Assistant,
    /// One session between two users, delivered over push with polling fallback.
    Direct { current_user: UserId, peer: UserId },
}

impl Surface {
    /// Cache key. The assistant surface keeps all of its sessions under `base`. A direct engine
    /// holds a single conversation, so each user pair gets its own `{base}:dm:{me}:{peer}` snapshot
    /// and opening one conversation never overwrites another one cached on the same device.
    pub fn storage_key(&self, base: &str) -> String {
        match self {
            Self::Assistant => base.to_string(),
            Self::Direct { current_user, peer } => format!("{base}:dm:{current_user}:{peer}"),
        }
    }

    fn author(&self) -> Author {
        match *self {
            Self::Assistant => Author::user(),
            Self::Direct { current_user, peer } => Author::Direct {
                sender_id: current_user,
                receiver_id: peer,
            },
        }
    }

    fn direct_session(&self) -> Option<SessionId> {
        match *self {
            Self::Assistant => None,
            Self::Direct { current_user, peer } => Some(SessionId::direct(current_user, peer)),
        }
    }
}

#[derive(Clone)]
pub struct EngineDependencies {
    pub history: Arc<dyn HistorySource>,
    pub outbound: Arc<dyn OutboundChannel>,
    pub status: Option<Arc<dyn StatusProbe>>,
    pub push: Option<Arc<PushChannelClient>>,
}

impl Default for EngineDependencies {
    fn default() -> Self {
        Self {
            history: Arc::new(MissingHistorySource),
            outbound: Arc::new(MissingOutboundChannel),
            status: None,
            push: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionsChanged(ConversationView),
    StatusChanged(ServiceStatus),
    PushStateChanged(PushState),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Mount,
    /// Fallback poll: no loading indicator, failures stay soft.
    Poll,
    Manual,
}

impl FetchMode {
    fn shows_loading(self) -> bool {
        !matches!(self, Self::Poll)
    }

    fn user_visible(self) -> bool {
        matches!(self, Self::Manual)
    }
}

struct EngineState {
    sessions: Vec<Session>,
    active: Option<SessionId>,
    loading: bool,
    last_error: Option<String>,
    sync_error: Option<String>,
    status: ServiceStatus,
    push_state: Option<PushState>,
}

impl EngineState {
    fn view(&self) -> ConversationView {
        ConversationView::derive(
            &self.sessions,
            self.active.as_ref(),
            ViewFlags {
                loading: self.loading,
                last_error: self.last_error.clone(),
                sync_error: self.sync_error.clone(),
                status: self.status.clone(),
                push_state: self.push_state,
            },
        )
    }

    fn flags(&self) -> (bool, Option<String>, Option<String>) {
        (self.loading, self.last_error.clone(), self.sync_error.clone())
    }
}

pub struct ConversationEngine {
    surface: Surface,
    config: EngineConfig,
    policy: DedupPolicy,
    cache: SessionCache,
    history: Arc<dyn HistorySource>,
    dispatcher: Dispatcher,
    status_probe: Option<Arc<dyn StatusProbe>>,
    push: Option<Arc<PushChannelClient>>,
    polling: Arc<PollingFallbackController>,
    scheduler: Scheduler,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    push_subscription: std::sync::Mutex<Option<SubscriptionId>>,
    started: AtomicBool,
    alive: AtomicBool,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl ConversationEngine {
    /// Restores the cached snapshot for `surface` and seeds what the surface needs to be usable:
    /// one local session on the assistant surface, the conversation session on the direct one.
    pub async fn open(
        surface: Surface,
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        dependencies: EngineDependencies,
    ) -> Arc<Self> {
        let cache = SessionCache::new(store, surface.storage_key(&config.storage_key));
        let mut sessions = cache.load().await;
        sort_sessions(&mut sessions);
        let restored = sessions.len();

        let now = Utc::now();
        let seeded = match surface {
            Surface::Assistant if sessions.is_empty() => {
                sessions.push(Session::new_local(default_session_title(1), now));
                true
            }
            Surface::Assistant => false,
            Surface::Direct { current_user, peer } => {
                let id = SessionId::direct(current_user, peer);
                if sessions.iter().any(|session| session.id == id) {
                    false
                } else {
                    sessions.push(Session::with_id(id, direct_session_title(peer), now));
                    sort_sessions(&mut sessions);
                    true
                }
            }
        };
        if seeded {
            cache.save(&sessions).await;
        }

        let active = surface
            .direct_session()
            .or_else(|| sessions.first().map(|session| session.id.clone()));
        info!(key = %cache.key(), restored, seeded, "engine: opened");

        let (events, _) = broadcast::channel(1024);
        let push_state = dependencies.push.as_ref().map(|push| push.state());
        Arc::new(Self {
            surface,
            policy: config.dedup_policy(),
            dispatcher: Dispatcher::new(dependencies.outbound, config.optimistic_cleanup),
            config,
            cache,
            history: dependencies.history,
            status_probe: dependencies.status,
            push: dependencies.push,
            polling: Arc::new(PollingFallbackController::new()),
            scheduler: Scheduler::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            push_subscription: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            inner: Mutex::new(EngineState {
                sessions,
                active,
                loading: false,
                last_error: None,
                sync_error: None,
                status: ServiceStatus::default(),
                push_state,
            }),
            events,
        })
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationView {
        self.inner.lock().await.view()
    }

    /// Connects push, runs the mount fetch and starts the timers. Later calls do nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) || !self.is_alive() {
            return;
        }

        if let (Some(push), Surface::Direct { current_user, peer }) = (&self.push, self.surface) {
            self.attach_push(push, current_user, peer).await;
        }

        let _ = self.sync_history(FetchMode::Mount).await;

        if matches!(self.surface, Surface::Direct { .. }) {
            let engine = Arc::downgrade(self);
            self.scheduler.schedule(self.config.poll_interval, move || {
                let engine = engine.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.poll_tick().await;
                    }
                }
            });

            let polling = Arc::clone(&self.polling);
            self.scheduler.schedule(self.config.push_health_reset, move || {
                polling.reset_health();
                future::ready(())
            });
        }

        if self.status_probe.is_some() {
            self.status_tick().await;
            let engine = Arc::downgrade(self);
            self.scheduler.schedule(self.config.status_interval, move || {
                let engine = engine.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.status_tick().await;
                    }
                }
            });
        }
        info!(surface = ?self.surface, timers = self.scheduler.active(), "engine: started");
    }

    async fn attach_push(self: &Arc<Self>, push: &Arc<PushChannelClient>, current_user: UserId, peer: UserId) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Message>();
        let polling = Arc::clone(&self.polling);
        let listener: PushListener = Arc::new(move |message: &Message| {
            polling.record_push_activity();
            let _ = inbound_tx.send(message.clone());
        });
        let subscription = push.subscribe(listener);
        *self
            .push_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        push.set_open_conversation(Some(ConversationKey::new(current_user, peer)));

        let engine: Weak<Self> = Arc::downgrade(self);
        let inbound = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.handle_push_message(message).await;
            }
        });

        let mut states = push.watch_state();
        let engine: Weak<Self> = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.on_push_state(state).await;
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([inbound, watcher]);
        push.connect(current_user).await;
    }

    /// Tears the engine down: timers, background tasks and the push subscription. Results of
    /// requests still in flight are discarded.
    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }

        if let Some(push) = &self.push {
            let subscription = self
                .push_subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(subscription) = subscription {
                push.unsubscribe(subscription);
            }
            push.set_open_conversation(None);
            push.disconnect().await;
        }
        info!(surface = ?self.surface, "engine: stopped");
    }

    /// Optimistically appends `content` to the active session and sends it. Returns the
    /// placeholder id the message was first shown under.
    pub async fn send(self: &Arc<Self>, content: &str) -> Result<MessageId, DispatchError> {
        if !self.is_alive() {
            return Err(DispatchError::Closed);
        }

        let (session, placeholder) = {
            let mut state = self.inner.lock().await;
            let plan = begin_send(
                &state.sessions,
                state.active.as_ref(),
                self.surface.author(),
                content,
                Utc::now(),
            )?;
            if plan.created_session {
                info!(session_id = %plan.session_id, "engine: created session for send");
            }
            let session_id = plan.session_id.clone();
            state.sessions = plan.sessions;
            state.active = Some(session_id.clone());
            state.last_error = None;
            self.commit(&state).await;

            let session = state
                .sessions
                .iter()
                .find(|session| session.id == session_id)
                .cloned()
                .ok_or(DispatchError::UnknownSession(session_id))?;
            (session, plan.message)
        };

        match self.dispatcher.deliver(&session, &placeholder).await {
            Ok(Delivery::Reply(reply)) => {
                if self.is_alive() {
                    let mut state = self.inner.lock().await;
                    state.sessions =
                        complete_with_reply(&state.sessions, &session.id, &placeholder.id, &reply, Utc::now());
                    self.commit(&state).await;
                }
                Ok(placeholder.id)
            }
            Ok(Delivery::Deferred) => {
                self.schedule_placeholder_cleanup(session.id, placeholder.id.clone());
                Ok(placeholder.id)
            }
            Err(err) => {
                if self.is_alive() {
                    let mut state = self.inner.lock().await;
                    if let Some(next) = remove_message(&state.sessions, &session.id, &placeholder.id) {
                        state.sessions = next;
                    }
                    state.last_error = Some(err.to_string());
                    self.commit(&state).await;
                    let _ = self.events.send(EngineEvent::Error(err.to_string()));
                }
                Err(err)
            }
        }
    }

    fn schedule_placeholder_cleanup(self: &Arc<Self>, session_id: SessionId, placeholder: MessageId) {
        let engine = Arc::downgrade(self);
        self.scheduler
            .schedule_once(self.dispatcher.cleanup_after(), move || async move {
                if let Some(engine) = engine.upgrade() {
                    engine.purge_placeholder(&session_id, &placeholder).await;
                }
            });
    }

    async fn purge_placeholder(&self, session_id: &SessionId, placeholder: &MessageId) {
        if !self.is_alive() {
            return;
        }
        let mut state = self.inner.lock().await;
        if let Some(next) = remove_message(&state.sessions, session_id, placeholder) {
            debug!(%session_id, message_id = %placeholder, "engine: purged optimistic placeholder");
            state.sessions = next;
            self.commit(&state).await;
        }
    }

    /// User-triggered history fetch: toggles the loading flag and reports failures as
    /// `last_error`.
    pub async fn refresh_history(&self) -> Result<(), TransportError> {
        self.sync_history(FetchMode::Manual).await
    }

    /// New local session on the assistant surface, made active.
    pub async fn create_session(&self) -> Result<SessionId, DispatchError> {
        if !self.is_alive() {
            return Err(DispatchError::Closed);
        }
        if self.surface != Surface::Assistant {
            return Err(DispatchError::SingleSession);
        }
        let mut state = self.inner.lock().await;
        let session = Session::new_local(default_session_title(state.sessions.len() + 1), Utc::now());
        let id = session.id.clone();
        let mut next = state.sessions.clone();
        next.insert(0, session);
        sort_sessions(&mut next);
        state.sessions = next;
        state.active = Some(id.clone());
        self.commit(&state).await;
        info!(session_id = %id, "engine: session created");
        Ok(id)
    }

    /// Returns whether the session exists and is now active.
    pub async fn select_session(&self, id: &SessionId) -> bool {
        let mut state = self.inner.lock().await;
        if !state.sessions.iter().any(|session| &session.id == id) {
            return false;
        }
        if state.active.as_ref() != Some(id) {
            state.active = Some(id.clone());
            self.emit_view(&state);
        }
        true
    }

    async fn sync_history(&self, mode: FetchMode) -> Result<(), TransportError> {
        if mode.shows_loading() {
            let mut state = self.inner.lock().await;
            state.loading = true;
            self.emit_view(&state);
        }

        let fetched = self.history.fetch_history().await;
        if !self.is_alive() {
            debug!(?mode, "engine: discarding history fetched after shutdown");
            return Ok(());
        }

        let mut state = self.inner.lock().await;
        let before = state.flags();
        if mode.shows_loading() {
            state.loading = false;
        }
        let result = match fetched {
            Ok(incoming) => {
                let next = reconcile(&state.sessions, &incoming, &self.policy);
                state.sync_error = None;
                if mode.user_visible() {
                    state.last_error = None;
                }
                if next != state.sessions {
                    debug!(?mode, fetched = incoming.len(), "engine: history merged");
                    state.sessions = next;
                    self.ensure_active(&mut state);
                    self.commit(&state).await;
                    return Ok(());
                }
                Ok(())
            }
            Err(err) => {
                warn!(?mode, "engine: history fetch failed: {err}");
                state.sync_error = Some(err.to_string());
                if mode.user_visible() {
                    state.last_error = Some(err.to_string());
                }
                Err(err)
            }
        };
        if state.flags() != before {
            self.emit_view(&state);
        }
        result
    }

    fn ensure_active(&self, state: &mut EngineState) {
        let known = state
            .active
            .as_ref()
            .is_some_and(|id| state.sessions.iter().any(|session| &session.id == id));
        if !known {
            state.active = self
                .surface
                .direct_session()
                .or_else(|| state.sessions.first().map(|session| session.id.clone()));
        }
    }

    async fn poll_tick(&self) -> PollDecision {
        let decision = self.polling.should_poll();
        match decision {
            PollDecision::Skip => debug!("poll: push healthy, skipping fetch"),
            PollDecision::Fetch => {
                debug!("poll: fetching history");
                let _ = self.sync_history(FetchMode::Poll).await;
            }
        }
        decision
    }

    async fn status_tick(&self) {
        let Some(probe) = &self.status_probe else {
            return;
        };
        let status = check_status(probe.as_ref(), Utc::now()).await;
        if !self.is_alive() {
            return;
        }
        self.inner.lock().await.status = status.clone();
        let _ = self.events.send(EngineEvent::StatusChanged(status));
    }

    async fn handle_push_message(&self, message: Message) {
        let Some(session_id) = self.surface.direct_session() else {
            return;
        };
        if !self.is_alive() {
            return;
        }
        let mut state = self.inner.lock().await;
        let message_id = message.id.clone();
        let (next, outcome) = apply_live_message(&state.sessions, &session_id, message, &self.policy);
        debug!(%session_id, %message_id, ?outcome, "engine: push message applied");
        if next != state.sessions {
            state.sessions = next;
            self.commit(&state).await;
        }
    }

    async fn on_push_state(&self, push_state: PushState) {
        if !self.is_alive() {
            return;
        }
        if push_state == PushState::Disconnected {
            warn!(surface = ?self.surface, "engine: push unavailable, relying on polling");
        }
        let mut state = self.inner.lock().await;
        state.push_state = Some(push_state);
        let _ = self.events.send(EngineEvent::PushStateChanged(push_state));
        self.emit_view(&state);
    }

    /// The single writer path: every committed list is persisted, then published.
    async fn commit(&self, state: &EngineState) {
        self.cache.save(&state.sessions).await;
        self.emit_view(state);
    }

    fn emit_view(&self, state: &EngineState) {
        let _ = self.events.send(EngineEvent::SessionsChanged(state.view()));
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
