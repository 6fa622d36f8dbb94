use super::*;

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::Author;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct Captured {
    chat: Arc<Mutex<Vec<Value>>>,
    direct: Arc<Mutex<Vec<Value>>>,
    conversation_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn history() -> Json<Value> {
    Json(json!({
        "history": [{
            "session_id": "s-9",
            "question": "Where do I upload my report?",
            "answer": "Use the documents tab.",
            "created_at": "2024-06-03T08:00:00Z",
            "updated_at": "2024-06-03T08:00:03Z"
        }]
    }))
}

async fn chat(State(captured): State<Captured>, Json(body): Json<Value>) -> Json<Value> {
    captured.chat.lock().await.push(body);
    Json(json!({ "response": "Use the documents tab.", "sources": ["guide.pdf"] }))
}

async fn status() -> &'static str {
    "RUNNING"
}

async fn conversation(
    State(captured): State<Captured>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    captured.conversation_queries.lock().await.push(query);
    Json(json!([
        { "id": 10, "senderId": 3, "receiverId": 5, "content": "hi", "timestamp": "2024-06-03T10:00:00" },
        { "id": 11, "senderId": 5, "receiverId": 3, "content": "hello", "timestamp": "2024-06-03T10:00:09" }
    ]))
}

async fn direct_send(State(captured): State<Captured>, Json(body): Json<Value>) -> StatusCode {
    captured.direct.lock().await.push(body);
    StatusCode::OK
}

async fn failing() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "message": "model is warming up" })),
    )
}

async fn spawn_backend(router: Router<Captured>) -> (String, Captured) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let captured = Captured::default();
    let app = router.with_state(captured.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), captured)
}

fn assistant_routes() -> Router<Captured> {
    Router::new()
        .route("/history", get(history))
        .route("/chat", post(chat))
        .route("/status", get(status))
}

fn direct_routes() -> Router<Captured> {
    Router::new()
        .route("/api/user-chat/conversation", get(conversation))
        .route("/api/user-chat/send", post(direct_send))
}

#[tokio::test]
async fn assistant_history_is_normalized_into_remote_sessions() {
    let (base, _) = spawn_backend(assistant_routes()).await;
    let api = AssistantApi::new(format!("{base}/"));

    let sessions = api.fetch_history().await.expect("history");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, SessionId::from("s-9"));
    assert_eq!(sessions[0].messages.len(), 2);
    assert_eq!(sessions[0].origin, Origin::Remote);
}

#[tokio::test]
async fn assistant_send_posts_question_and_returns_reply() {
    let (base, captured) = spawn_backend(assistant_routes()).await;
    let api = AssistantApi::new(base);
    let mut session = Session::new_local("Session 1", Utc::now());
    session.remote_id = Some("s-9".into());
    let message = Message::optimistic(Author::user(), "Where do I upload?", Utc::now());

    let delivery = api.send(&session, &message).await.expect("send");
    assert_eq!(
        delivery,
        Delivery::Reply(AssistantReply {
            answer: "Use the documents tab.".into(),
            sources: vec!["guide.pdf".into()],
        })
    );
    let requests = captured.chat.lock().await;
    assert_eq!(
        requests[0],
        json!({ "question": "Where do I upload?", "session_id": "s-9" })
    );
}

#[tokio::test]
async fn local_sessions_are_sent_under_their_own_id() {
    let (base, captured) = spawn_backend(assistant_routes()).await;
    let api = AssistantApi::new(base);
    let session = Session::new_local("Session 2", Utc::now());
    let message = Message::optimistic(Author::user(), "hi", Utc::now());

    api.send(&session, &message).await.expect("send");
    assert_eq!(
        captured.chat.lock().await[0]["session_id"],
        json!(session.id.as_str())
    );
}

#[tokio::test]
async fn status_probe_reads_plain_text_bodies() {
    let (base, _) = spawn_backend(assistant_routes()).await;
    let api = AssistantApi::new(base);
    assert_eq!(api.probe().await.expect("probe"), ServiceState::Online);
}

#[tokio::test]
async fn error_statuses_carry_the_backend_message() {
    let (base, _) = spawn_backend(Router::new().route("/chat", post(failing))).await;
    let api = AssistantApi::new(base);
    let session = Session::new_local("Session 1", Utc::now());
    let message = Message::optimistic(Author::user(), "hi", Utc::now());

    match api.send(&session, &message).await {
        Err(TransportError::Status { status, message, .. }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "model is warming up");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_backend_is_a_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

    let api = AssistantApi::new(format!("http://{addr}"));
    assert!(matches!(
        api.fetch_history().await,
        Err(TransportError::Request { .. })
    ));
}

#[tokio::test]
async fn direct_conversation_becomes_one_session() {
    let (base, captured) = spawn_backend(direct_routes()).await;
    let api = DirectChatApi::new(format!("{base}/api"), UserId(3), UserId(5));

    let sessions = api.fetch_history().await.expect("conversation");
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.id, SessionId::from("dm-3-5"));
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.updated_at, session.messages[1].timestamp);
    assert_eq!(session.created_at, session.messages[0].timestamp);

    let queries = captured.conversation_queries.lock().await;
    assert_eq!(queries[0].get("user1").map(String::as_str), Some("3"));
    assert_eq!(queries[0].get("user2").map(String::as_str), Some("5"));
}

#[tokio::test]
async fn direct_send_is_deferred_and_uses_camel_case() {
    let (base, captured) = spawn_backend(direct_routes()).await;
    let api = DirectChatApi::new(format!("{base}/api"), UserId(3), UserId(5));
    let session = Session::with_id(api.session_id(), direct_session_title(UserId(5)), Utc::now());
    let message = Message::optimistic(
        Author::Direct {
            sender_id: UserId(3),
            receiver_id: UserId(5),
        },
        "see you at nine",
        Utc::now(),
    );

    assert_eq!(api.send(&session, &message).await.expect("send"), Delivery::Deferred);
    assert_eq!(
        captured.direct.lock().await[0],
        json!({ "senderId": 3, "receiverId": 5, "content": "see you at nine" })
    );
}

#[tokio::test]
async fn missing_outbound_channel_refuses_to_send() {
    let session = Session::new_local("Session 1", Utc::now());
    let message = Message::optimistic(Author::user(), "hi", Utc::now());
    assert!(matches!(
        MissingOutboundChannel.send(&session, &message).await,
        Err(TransportError::NotConfigured(_))
    ));
    assert!(MissingHistorySource.fetch_history().await.expect("empty").is_empty());
}
