use super::*;

use chrono::TimeZone;
use serde_json::json;
use shared::domain::UserId;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, hour, minute, 0)
        .single()
        .expect("valid time")
}

#[test]
fn folds_flat_question_answer_entries_into_one_session() {
    let payload = json!({
        "history": [
            {
                "session_id": "s-1",
                "question": "What is OJT?",
                "answer": "On-the-job training.",
                "created_at": "2024-06-03T08:00:00Z",
                "updated_at": "2024-06-03T08:00:05Z",
                "sources": ["handbook.pdf"]
            },
            {
                "session_id": "s-1",
                "question": "Deadline?",
                "response": "End of May.",
                "created_at": "2024-06-03T09:00:00Z",
                "updated_at": "2024-06-03T09:00:04Z"
            }
        ]
    });

    let sessions = history_sessions(&payload, at(12, 0));
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.id, SessionId::from("s-1"));
    assert_eq!(session.remote_id.as_deref(), Some("s-1"));
    assert_eq!(session.origin, Origin::Remote);
    assert_eq!(session.title, "Session 1");
    assert_eq!(session.created_at, at(8, 0));
    assert_eq!(session.updated_at, Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 4).single().expect("time"));

    let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["What is OJT?", "On-the-job training.", "Deadline?", "End of May."]
    );
    assert_eq!(session.messages[0].author, Author::user());
    assert_eq!(session.messages[1].author, Author::assistant());
    assert_eq!(session.messages[1].sources, vec!["handbook.pdf".to_string()]);
}

#[test]
fn generated_ids_are_stable_across_fetches() {
    let payload = json!([{ "sessionId": 9, "question": "hi", "answer": "hello" }]);
    let first = history_sessions(&payload, at(10, 0));
    let second = history_sessions(&payload, at(10, 3));
    let ids = |sessions: &[Session]| -> Vec<MessageId> {
        sessions[0].messages.iter().map(|m| m.id.clone()).collect()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first[0].id, SessionId::from("9"));
}

#[test]
fn reads_message_arrays_and_titles() {
    let payload = json!({
        "sessions": [{
            "id": "abc",
            "title": "  Internship questions  ",
            "messages": [
                { "id": "m1", "sender": "ai", "content": "Welcome", "ts": "2024-06-03T07:00:00Z" },
                { "id": "m2", "role": "user", "text": "Thanks", "timestamp": "2024-06-03T07:01:00Z", "pending": 1 },
                { "id": "m1", "role": "user", "text": "duplicate id" },
                "not an object"
            ]
        }]
    });

    let sessions = history_sessions(&payload, at(12, 0));
    let session = &sessions[0];
    assert_eq!(session.title, "Internship questions");
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].author, Author::assistant());
    assert_eq!(session.messages[0].content, "Welcome");
    assert!(session.messages[1].pending);
    assert_eq!(session.created_at, at(7, 0));
    assert_eq!(session.updated_at, at(7, 1));
}

#[test]
fn unreadable_history_normalizes_to_empty() {
    assert!(history_sessions(&Value::Null, at(1, 0)).is_empty());
    assert!(history_sessions(&json!("oops"), at(1, 0)).is_empty());
    assert!(history_sessions(&json!({"items": []}), at(1, 0)).is_empty());
    assert!(history_sessions(&json!([null, 3, "x"]), at(1, 0)).is_empty());
}

#[test]
fn entries_without_session_ids_get_remote_keys() {
    let payload = json!([{ "question": "a" }, { "question": "b" }]);
    let sessions = history_sessions(&payload, at(1, 0));
    let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["remote-1", "remote-2"]);
}

#[test]
fn direct_messages_accept_wrapped_payloads_and_skip_bad_rows() {
    let payload = json!({
        "data": [
            { "id": 1, "senderId": 4, "receiverId": 8, "content": "hey", "timestamp": "2024-06-03T10:00:00" },
            { "id": 2, "senderId": "four", "receiverId": 8, "content": "bad sender" },
            { "id": 3, "senderId": 8, "receiverId": 4, "content": "yo", "timestamp": "2024-06-03T10:00:02Z" }
        ]
    });
    let messages = direct_messages(&payload);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, MessageId::from("1"));
    assert_eq!(
        messages[1].author,
        Author::Direct {
            sender_id: UserId(8),
            receiver_id: UserId(4)
        }
    );
    assert!(direct_messages(&json!({"data": "nope"})).is_empty());
}

#[test]
fn assistant_reply_prefers_answer_fields_in_order() {
    let reply = assistant_reply(&json!({"response": "r", "content": "c", "sources": ["a", 3]}));
    assert_eq!(reply.answer, "r");
    assert_eq!(reply.sources, vec!["a".to_string()]);

    assert_eq!(assistant_reply(&json!("plain answer")).answer, "plain answer");
    assert_eq!(assistant_reply(&json!({"answer": ""})).answer, EMPTY_ANSWER_FALLBACK);
    assert_eq!(assistant_reply(&Value::Null).answer, EMPTY_ANSWER_FALLBACK);
}

#[test]
fn status_vocabulary_maps_to_three_states() {
    assert_eq!(interpret_status(&json!("OK")), ServiceState::Online);
    assert_eq!(interpret_status(&json!({"status": " healthy "})), ServiceState::Online);
    assert_eq!(interpret_status(&json!({"state": "failed"})), ServiceState::Offline);
    assert_eq!(interpret_status(&json!({"message": "warming up"})), ServiceState::Unknown);
    assert_eq!(interpret_status(&json!({"status": true})), ServiceState::Unknown);
    assert_eq!(interpret_status(&json_or_text("<html>gateway</html>")), ServiceState::Unknown);
}
