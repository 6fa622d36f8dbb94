//! Long-lived push channel: one connection per user, relevance filtering for the open
//! conversation and fan-out to subscribers.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{Message, UserId},
    protocol::{
        hub::{self, HandshakeRequest, HandshakeResponse, HubFrame},
        DirectMessagePayload,
    },
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PushError;

const SIGNAL_BUFFER: usize = 256;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What a transport reports back while it runs.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    State(PushState),
    Message(DirectMessagePayload),
}

/// The connection itself. `run` owns reconnection and returns only once it has given up; the
/// client then settles in `Disconnected`.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn run(&self, user_id: UserId, signals: mpsc::Sender<TransportSignal>);
}

/// The conversation currently on screen, as seen from `current_user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationKey {
    pub current_user: UserId,
    pub peer: UserId,
}

impl ConversationKey {
    pub fn new(current_user: UserId, peer: UserId) -> Self {
        Self { current_user, peer }
    }

    /// Sent by either party to the other.
    pub fn matches(&self, sender: UserId, receiver: UserId) -> bool {
        (sender == self.current_user && receiver == self.peer)
            || (sender == self.peer && receiver == self.current_user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type PushListener = Arc<dyn Fn(&Message) + Send + Sync>;

struct Connection {
    user_id: UserId,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PushChannelClient {
    transport: Arc<dyn PushTransport>,
    connection: Mutex<Option<Connection>>,
    /// Replaced wholesale on every change so fan-out iterates a stable snapshot.
    listeners: RwLock<Arc<Vec<(SubscriptionId, PushListener)>>>,
    next_subscription: AtomicU64,
    open_conversation: RwLock<Option<ConversationKey>>,
    state: watch::Sender<PushState>,
}

impl PushChannelClient {
    pub fn new(transport: Arc<dyn PushTransport>) -> Arc<Self> {
        let (state, _) = watch::channel(PushState::Disconnected);
        Arc::new(Self {
            transport,
            connection: Mutex::new(None),
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_subscription: AtomicU64::new(0),
            open_conversation: RwLock::new(None),
            state,
        })
    }

    pub fn state(&self) -> PushState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PushState> {
        self.state.subscribe()
    }

    /// Opens the connection for `user_id`. A no-op while a connection for the same user is live;
    /// a different user replaces the existing connection.
    pub async fn connect(self: &Arc<Self>, user_id: UserId) {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            let live = self.state() != PushState::Disconnected;
            if existing.user_id == user_id && live {
                debug!(user_id = user_id.0, "push: already connected");
                return;
            }
            for task in &existing.tasks {
                task.abort();
            }
        }

        info!(user_id = user_id.0, "push: connecting");
        self.set_state(PushState::Connecting);
        let (signals, mut inbound) = mpsc::channel(SIGNAL_BUFFER);

        let transport = Arc::clone(&self.transport);
        let runner = tokio::spawn(async move {
            transport.run(user_id, signals).await;
        });

        let client: Weak<Self> = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                let Some(client) = client.upgrade() else {
                    return;
                };
                client.handle_signal(signal);
            }
            if let Some(client) = client.upgrade() {
                info!(user_id = user_id.0, "push: transport stopped");
                client.set_state(PushState::Disconnected);
            }
        });

        *connection = Some(Connection {
            user_id,
            tasks: vec![runner, pump],
        });
    }

    /// Stops the transport and drops every subscriber.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            info!(user_id = connection.user_id.0, "push: disconnecting");
            for task in connection.tasks {
                task.abort();
            }
        }
        *self.listeners.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Vec::new());
        self.set_state(PushState::Disconnected);
    }

    pub fn subscribe(&self, listener: PushListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**listeners).clone();
        next.push((id, listener));
        *listeners = Arc::new(next);
        id
    }

    /// Returns whether the subscription was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let next: Vec<_> = listeners
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let removed = next.len() != listeners.len();
        *listeners = Arc::new(next);
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Messages outside this conversation are dropped before fan-out; `None` drops everything.
    pub fn set_open_conversation(&self, conversation: Option<ConversationKey>) {
        *self
            .open_conversation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = conversation;
    }

    fn set_state(&self, next: PushState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "push: state changed");
        }
    }

    fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::State(state) => self.set_state(state),
            TransportSignal::Message(payload) => self.fan_out(payload),
        }
    }

    fn fan_out(&self, payload: DirectMessagePayload) {
        let conversation = *self
            .open_conversation
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let relevant = conversation
            .is_some_and(|key| key.matches(payload.sender_id, payload.receiver_id));
        if !relevant {
            debug!(
                sender_id = payload.sender_id.0,
                receiver_id = payload.receiver_id.0,
                "push: dropping message for another conversation"
            );
            return;
        }

        let message = Message::from(payload);
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (_, listener) in listeners.iter() {
            listener(&message);
        }
    }
}

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON hub protocol over WebSocket, as served at `{push_url}?userId=<id>`.
pub struct WebSocketTransport {
    endpoint: Url,
    retry_delays: Vec<Duration>,
    keepalive: Duration,
}

impl WebSocketTransport {
    /// Accepts `http(s)://` (rewritten to `ws(s)://`) or `ws(s)://` endpoints.
    pub fn new(push_url: &str, retry_delays: Vec<Duration>) -> Result<Self, PushError> {
        let push_url = push_url.trim().trim_end_matches('/');
        let ws_url = if let Some(rest) = push_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = push_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if push_url.starts_with("ws://") || push_url.starts_with("wss://") {
            push_url.to_string()
        } else {
            return Err(PushError::UnsupportedUrl(push_url.to_string()));
        };
        let endpoint = Url::parse(&ws_url).map_err(|source| PushError::InvalidUrl {
            url: ws_url.clone(),
            source,
        })?;
        Ok(Self {
            endpoint,
            retry_delays,
            keepalive: KEEPALIVE_INTERVAL,
        })
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn url_for(&self, user_id: UserId) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("userId", &user_id.to_string());
        url.to_string()
    }

    async fn open(&self, url: &str) -> Result<(HubStream, Vec<String>), PushError> {
        let (mut stream, _) = connect_async(url)
            .await
            .map_err(|err| PushError::Connect(err.to_string()))?;

        let handshake = hub::encode_record(&HandshakeRequest::default())
            .map_err(|err| PushError::Handshake(err.to_string()))?;
        stream
            .send(WsMessage::Text(handshake))
            .await
            .map_err(|err| PushError::Connect(err.to_string()))?;

        loop {
            let text = match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(PushError::Handshake("connection closed during handshake".into()))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(PushError::Connect(err.to_string())),
            };
            let mut records = hub::split_records(&text);
            let Some(first) = records.next() else {
                continue;
            };
            let response: HandshakeResponse = serde_json::from_str(first)
                .map_err(|err| PushError::Handshake(format!("unreadable handshake response: {err}")))?;
            if let Some(error) = response.error {
                return Err(PushError::Handshake(error));
            }
            let leftover = records.map(str::to_string).collect();
            return Ok((stream, leftover));
        }
    }

    /// Pumps one established connection until it drops. Returns `false` once nobody is
    /// listening any more.
    async fn pump(
        &self,
        stream: HubStream,
        leftover: Vec<String>,
        signals: &mpsc::Sender<TransportSignal>,
    ) -> bool {
        for record in &leftover {
            if !forward_record(record, signals).await {
                return false;
            }
        }

        let (mut writer, mut reader) = stream.split();
        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = signals.closed() => return false,
                _ = keepalive.tick() => {
                    let ping = match hub::encode_record(&HubFrame::ping()) {
                        Ok(ping) => ping,
                        Err(err) => {
                            warn!("push: unable to encode keepalive: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(WsMessage::Text(ping)).await {
                        warn!("push: keepalive failed: {err}");
                        return true;
                    }
                }
                inbound = reader.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        for record in hub::split_records(&text) {
                            if !forward_record(record, signals).await {
                                return false;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("push: receive failed: {err}");
                        return true;
                    }
                },
            }
        }
    }
}

/// Returns `false` once the receiving side is gone.
async fn forward_record(record: &str, signals: &mpsc::Sender<TransportSignal>) -> bool {
    let frame: HubFrame = match serde_json::from_str(record) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("push: ignoring unreadable hub record: {err}");
            return true;
        }
    };
    match frame.kind {
        hub::INVOCATION if frame.target.as_deref() == Some(hub::RECEIVE_MESSAGE_TARGET) => {
            let Some(argument) = frame.arguments.into_iter().next() else {
                warn!("push: ReceiveMessage without payload");
                return true;
            };
            match serde_json::from_value::<DirectMessagePayload>(argument) {
                Ok(payload) => signals.send(TransportSignal::Message(payload)).await.is_ok(),
                Err(err) => {
                    warn!("push: ignoring malformed ReceiveMessage payload: {err}");
                    true
                }
            }
        }
        hub::PING => true,
        hub::CLOSE => {
            warn!(error = ?frame.error, "push: hub closed the connection");
            true
        }
        other => {
            debug!(kind = other, target = ?frame.target, "push: ignoring hub frame");
            true
        }
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn run(&self, user_id: UserId, signals: mpsc::Sender<TransportSignal>) {
        let url = self.url_for(user_id);
        let mut established_once = false;
        let mut attempt = 0usize;

        loop {
            match self.open(&url).await {
                Ok((stream, leftover)) => {
                    info!(user_id = user_id.0, "push: connected");
                    established_once = true;
                    attempt = 0;
                    if signals.send(TransportSignal::State(PushState::Connected)).await.is_err() {
                        return;
                    }
                    if !self.pump(stream, leftover, &signals).await {
                        return;
                    }
                    warn!(user_id = user_id.0, "push: connection dropped");
                }
                Err(err) if !established_once => {
                    warn!(user_id = user_id.0, "push: initial connect failed: {err}");
                    return;
                }
                Err(err) => warn!(user_id = user_id.0, attempt, "push: reconnect failed: {err}"),
            }

            let Some(delay) = self.retry_delays.get(attempt).copied() else {
                warn!(user_id = user_id.0, "push: giving up after {attempt} reconnect attempts");
                return;
            };
            attempt += 1;
            if signals.send(TransportSignal::State(PushState::Reconnecting)).await.is_err() {
                return;
            }
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
