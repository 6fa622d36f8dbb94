use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use client_core::{
    push::{PushTransport, TransportSignal},
    EngineConfig, PushChannelClient, PushState, WebSocketTransport,
};
use shared::{domain::UserId, protocol::hub};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout, Instant},
};

/// How the hub treats each incoming connection, by arrival order.
#[derive(Clone)]
struct HubScript {
    /// Connections from this index on get `{"error":..}` as handshake response.
    accept_handshakes: usize,
    /// Accepted connections below this index are closed right after the handshake.
    close_after_handshake: usize,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl HubScript {
    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn chat_hub(ws: WebSocketUpgrade, State(script): State<HubScript>) -> Response {
    let index = script.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| hub_session(socket, script, index))
}

async fn hub_session(mut socket: WebSocket, script: HubScript, index: usize) {
    match socket.recv().await {
        Some(Ok(WsMessage::Text(_))) => {}
        _ => return,
    }
    if index >= script.accept_handshakes {
        let _ = socket
            .send(WsMessage::Text("{\"error\":\"user is not allowed\"}\u{1e}".into()))
            .await;
        return;
    }
    if socket.send(WsMessage::Text("{}\u{1e}".into())).await.is_err() {
        return;
    }
    if index < script.close_after_handshake {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let pings = hub::split_records(&text)
                .filter(|record| record.contains("\"type\":6"))
                .count();
            script.pings.fetch_add(pings, Ordering::SeqCst);
        }
    }
}

async fn spawn_hub(accept_handshakes: usize, close_after_handshake: usize) -> Result<(String, HubScript)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let script = HubScript {
        accept_handshakes,
        close_after_handshake,
        connections: Arc::new(AtomicUsize::new(0)),
        pings: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/chatHub", get(chat_hub))
        .with_state(script.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/chatHub"), script))
}

fn short_delays() -> Vec<Duration> {
    vec![Duration::ZERO, Duration::from_millis(50)]
}

fn run_transport(transport: WebSocketTransport) -> mpsc::Receiver<TransportSignal> {
    let (signals, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        transport.run(UserId(5), signals).await;
    });
    rx
}

async fn next_signal(rx: &mut mpsc::Receiver<TransportSignal>) -> Option<TransportSignal> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("transport signalled in time")
}

async fn next_state(rx: &mut mpsc::Receiver<TransportSignal>) -> PushState {
    match next_signal(rx).await {
        Some(TransportSignal::State(state)) => state,
        other => panic!("expected a state signal, got {other:?}"),
    }
}

async fn wait_disconnected(push: &PushChannelClient) {
    let mut states = push.watch_state();
    timeout(Duration::from_secs(5), states.wait_for(|state| *state == PushState::Disconnected))
        .await
        .expect("settled in time")
        .expect("state channel open");
}

#[test]
fn default_reconnect_delays() {
    let delays: Vec<u64> = EngineConfig::default()
        .push_retry_delays
        .iter()
        .map(Duration::as_secs)
        .collect();
    assert_eq!(delays, vec![0, 2, 10, 30]);
}

#[tokio::test]
async fn dropped_connection_is_reestablished() {
    let (url, script) = spawn_hub(usize::MAX, 1).await.expect("spawn hub");
    let transport = WebSocketTransport::new(&url, short_delays()).expect("push url");
    let mut rx = run_transport(transport);

    assert_eq!(next_state(&mut rx).await, PushState::Connected);
    assert_eq!(next_state(&mut rx).await, PushState::Reconnecting);
    assert_eq!(next_state(&mut rx).await, PushState::Connected);
    assert_eq!(script.connections(), 2);
}

#[tokio::test]
async fn reconnect_gives_up_after_the_last_delay() {
    let (url, script) = spawn_hub(1, 1).await.expect("spawn hub");
    let transport = WebSocketTransport::new(&url, short_delays()).expect("push url");
    let mut rx = run_transport(transport);

    assert_eq!(next_state(&mut rx).await, PushState::Connected);
    assert_eq!(next_state(&mut rx).await, PushState::Reconnecting);
    assert_eq!(next_state(&mut rx).await, PushState::Reconnecting);
    assert!(next_signal(&mut rx).await.is_none(), "transport should stop after the last delay");
    assert_eq!(script.connections(), 3);

    let (url, script) = spawn_hub(1, 1).await.expect("spawn hub");
    let push = PushChannelClient::new(Arc::new(
        WebSocketTransport::new(&url, short_delays()).expect("push url"),
    ));
    push.connect(UserId(5)).await;
    wait_disconnected(&push).await;
    assert_eq!(script.connections(), 3);
}

#[tokio::test]
async fn failed_initial_connect_settles_disconnected() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let url = format!("http://{addr}/chatHub");

    let transport = WebSocketTransport::new(&url, short_delays()).expect("push url");
    let mut rx = run_transport(transport);
    assert!(next_signal(&mut rx).await.is_none());

    let push = PushChannelClient::new(Arc::new(
        WebSocketTransport::new(&url, short_delays()).expect("push url"),
    ));
    push.connect(UserId(5)).await;
    wait_disconnected(&push).await;
}

#[tokio::test]
async fn rejected_handshake_is_not_retried() {
    let (url, script) = spawn_hub(0, 0).await.expect("spawn hub");
    let transport = WebSocketTransport::new(&url, short_delays()).expect("push url");
    let mut rx = run_transport(transport);

    assert!(next_signal(&mut rx).await.is_none());
    assert_eq!(script.connections(), 1);
}

#[tokio::test]
async fn idle_connection_sends_keepalive_pings() {
    let (url, script) = spawn_hub(usize::MAX, 0).await.expect("spawn hub");
    let transport = WebSocketTransport::new(&url, short_delays())
        .expect("push url")
        .with_keepalive(Duration::from_millis(50));
    let mut rx = run_transport(transport);
    assert_eq!(next_state(&mut rx).await, PushState::Connected);

    let deadline = Instant::now() + Duration::from_secs(5);
    while script.pings.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "no keepalive pings reached the hub");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(script.connections(), 1);
}
