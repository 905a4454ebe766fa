use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use chatterbox_core::gateway::ScriptedGateway;
use chatterbox_core::{
    ChatStore, FALLBACK_REPLY, GatewayError, Orchestrator, Role, SqliteStore, TurnEvent,
    parse_frames,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build;
use crate::config::{Config, parse_tokens};
use crate::middleware::trace::X_TRACE_ID;
use crate::state::AppState;

const ALICE: &str = "token-alice";
const BOB: &str = "token-bob";

async fn app(gateway: ScriptedGateway) -> (Router, Arc<AppState>) {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let config = Config {
        api_tokens: parse_tokens(&format!("{ALICE}=alice,{BOB}=bob")),
        enable_swagger: false,
        ..Config::default()
    };
    let orchestrator = Orchestrator::new(Arc::new(store), Arc::new(gateway), config.turn_settings());
    let state = Arc::new(AppState {
        config: Arc::new(config),
        orchestrator,
    });
    (build(Arc::clone(&state)), state)
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    (status, serde_json::from_str(&body).unwrap())
}

async fn new_chat(app: &Router, token: &str) -> String {
    let (status, body) = send_json(app, request(Method::POST, "/api/chat", Some(token), None)).await;
    assert_eq!(status, StatusCode::CREATED);
    body["chat"]["id"].as_str().unwrap().to_owned()
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_routes_require_a_known_token() {
    let (app, _) = app(ScriptedGateway::streaming(["x"])).await;

    let (status, body) = send_json(&app, request(Method::GET, "/api/chat", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Unauthorized" }));

    let (status, _) = send(&app, request(Method::GET, "/api/chat", Some("nope"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send_json(&app, request(Method::GET, "/api/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn responses_carry_a_trace_id() {
    let (app, _) = app(ScriptedGateway::streaming(["x"])).await;
    let response = app
        .oneshot(request(Method::GET, "/api/health", None, None))
        .await
        .unwrap();
    assert!(response.headers().contains_key(X_TRACE_ID));
}

// ── Chat CRUD ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_defaults_title_and_hides_owner() {
    let (app, _) = app(ScriptedGateway::streaming(["x"])).await;

    let (status, body) = send_json(&app, request(Method::POST, "/api/chat", Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["chat"]["title"], "New Chat");
    assert!(body["chat"].get("ownerId").is_none());
    assert!(body["chat"]["createdAt"].is_string());

    let (_, body) = send_json(
        &app,
        request(Method::POST, "/api/chat", Some(ALICE), Some(json!({ "title": "  " }))),
    )
    .await;
    assert_eq!(body["chat"]["title"], "New Chat");

    let (_, body) = send_json(
        &app,
        request(Method::POST, "/api/chat", Some(ALICE), Some(json!({ "title": "Trip" }))),
    )
    .await;
    assert_eq!(body["chat"]["title"], "Trip");
}

#[tokio::test]
async fn list_is_per_owner_with_counts_and_latest_activity_first() {
    let (app, _) = app(ScriptedGateway::streaming(["reply"])).await;
    let first = new_chat(&app, ALICE).await;
    let second = new_chat(&app, ALICE).await;
    new_chat(&app, BOB).await;

    let uri = format!("/api/chat/{first}/message");
    let (status, _) = send(
        &app,
        request(Method::POST, &uri, Some(ALICE), Some(json!({ "content": "hi" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send_json(&app, request(Method::GET, "/api/chat", Some(ALICE), None)).await;
    let chats = body["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0]["id"], first.as_str());
    assert_eq!(chats[0]["messageCount"], 2);
    assert_eq!(chats[1]["id"], second.as_str());
    assert_eq!(chats[1]["messageCount"], 0);
}

#[tokio::test]
async fn other_owners_chat_is_not_found() {
    let (app, _) = app(ScriptedGateway::streaming(["x"])).await;
    let chat = new_chat(&app, BOB).await;
    let uri = format!("/api/chat/{chat}");

    let (status, body) = send_json(&app, request(Method::GET, &uri, Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "Chat not found" }));

    let (status, _) = send(&app, request(Method::DELETE, &uri, Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        request(Method::POST, &format!("{uri}/message"), Some(ALICE), Some(json!({ "content": "hi" }))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_chat_and_messages() {
    let (app, state) = app(ScriptedGateway::streaming(["x"])).await;
    let chat = new_chat(&app, ALICE).await;
    let uri = format!("/api/chat/{chat}");
    send(
        &app,
        request(Method::POST, &format!("{uri}/message"), Some(ALICE), Some(json!({ "content": "hi" }))),
    )
    .await;

    let (status, body) = send_json(&app, request(Method::DELETE, &uri, Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (status, _) = send(&app, request(Method::GET, &uri, Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(state.store().list_messages(&chat).await.unwrap().is_empty());
}

// ── Non-streaming turn ────────────────────────────────────────────────────────

#[tokio::test]
async fn message_returns_both_halves_and_history_shows_them_in_order() {
    let (app, _) = app(ScriptedGateway::streaming(["Hi", " there", "!"])).await;
    let chat = new_chat(&app, ALICE).await;

    let (status, body) = send_json(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message"),
            Some(ALICE),
            Some(json!({ "content": "Hello" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userMessage"]["content"], "Hello");
    assert_eq!(body["userMessage"]["role"], "user");
    assert_eq!(body["userMessage"]["chatId"], chat.as_str());
    assert_eq!(body["assistantMessage"]["content"], "Hi there!");
    assert_eq!(body["assistantMessage"]["role"], "assistant");

    let (_, body) = send_json(
        &app,
        request(Method::GET, &format!("/api/chat/{chat}"), Some(ALICE), None),
    )
    .await;
    let contents: Vec<_> = body["chat"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(contents, ["Hello", "Hi there!"]);
}

#[tokio::test]
async fn message_generation_failure_is_502_and_keeps_user_message() {
    let gateway = ScriptedGateway::failing_after(["x"], GatewayError::Transport("refused".into()));
    let (app, state) = app(gateway).await;
    let chat = new_chat(&app, ALICE).await;

    let (status, body) = send_json(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message"),
            Some(ALICE),
            Some(json!({ "content": "Hello" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, json!({ "error": "Failed to generate AI response" }));

    let stored = state.store().list_messages(&chat).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].role, Role::User);
}

#[tokio::test]
async fn invalid_bodies_are_400_json() {
    let (app, state) = app(ScriptedGateway::streaming(["x"])).await;
    let chat = new_chat(&app, ALICE).await;
    let uri = format!("/api/chat/{chat}/message");

    let (status, body) = send_json(
        &app,
        request(Method::POST, &uri, Some(ALICE), Some(json!({ "content": "   " }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send_json(
        &app,
        request(Method::POST, &uri, Some(ALICE), Some(json!({ "text": "wrong field" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    assert!(state.store().list_messages(&chat).await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_body_is_413_json() {
    let (app, state) = app(ScriptedGateway::streaming(["x"])).await;
    let chat = new_chat(&app, ALICE).await;
    let content = "a".repeat(3 * 1024 * 1024);

    let (status, body) = send_json(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message"),
            Some(ALICE),
            Some(json!({ "content": content })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body, json!({ "error": "Request body too large" }));
    assert!(state.store().list_messages(&chat).await.unwrap().is_empty());
}

// ── Streaming turn ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_emits_user_message_chunks_then_done() {
    let (app, state) = app(ScriptedGateway::streaming(["Hi", " there", "!"])).await;
    let chat = new_chat(&app, ALICE).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/chat/{chat}/message/stream"),
            Some(ALICE),
            Some(json!({ "content": "Hello" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_owned();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.starts_with("event: message\n"));

    let events = parse_frames(&body).unwrap();
    assert_eq!(events.len(), 5);
    assert!(matches!(&events[0], TurnEvent::UserMessage { message } if message.content == "Hello"));
    assert_eq!(events[1], TurnEvent::Chunk { content: "Hi".into() });
    assert_eq!(events[2], TurnEvent::Chunk { content: " there".into() });
    assert_eq!(events[3], TurnEvent::Chunk { content: "!".into() });
    assert!(matches!(&events[4], TurnEvent::Done { message } if message.content == "Hi there!"));

    assert_eq!(state.store().list_messages(&chat).await.unwrap().len(), 2);
}

#[tokio::test]
async fn stream_failure_ends_with_error_event() {
    let gateway = ScriptedGateway::failing_after(["Par"], GatewayError::Stream("overloaded".into()));
    let (app, state) = app(gateway).await;
    let chat = new_chat(&app, ALICE).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message/stream"),
            Some(ALICE),
            Some(json!({ "content": "Hello" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: error\n"));
    assert!(!body.contains("overloaded"));

    let events = parse_frames(&body).unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1], TurnEvent::Chunk { content: "Par".into() });
    assert_eq!(
        events[2],
        TurnEvent::Error { error: "Failed to generate response".into() }
    );
    assert_eq!(state.store().list_messages(&chat).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_model_output_streams_the_fallback() {
    let (app, _) = app(ScriptedGateway::streaming(Vec::<String>::new())).await;
    let chat = new_chat(&app, ALICE).await;

    let (_, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message/stream"),
            Some(ALICE),
            Some(json!({ "content": "Hello" })),
        ),
    )
    .await;
    let events = parse_frames(&body).unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], TurnEvent::Done { message } if message.content == FALLBACK_REPLY));
}

#[tokio::test]
async fn stream_rejections_are_plain_json_errors() {
    let (app, _) = app(ScriptedGateway::streaming(["x"])).await;
    let chat = new_chat(&app, ALICE).await;

    let (status, body) = send_json(
        &app,
        request(
            Method::POST,
            &format!("/api/chat/{chat}/message/stream"),
            Some(ALICE),
            Some(json!({ "content": "" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send_json(
        &app,
        request(
            Method::POST,
            "/api/chat/missing/message/stream",
            Some(ALICE),
            Some(json!({ "content": "hi" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "Chat not found" }));
}

#[tokio::test]
async fn concurrent_turn_on_same_chat_is_409() {
    let gateway = ScriptedGateway::streaming(["slow"]).with_delay(std::time::Duration::from_millis(200));
    let (app, state) = app(gateway).await;
    let chat = new_chat(&app, ALICE).await;
    let uri = format!("/api/chat/{chat}/message");

    let first = tokio::spawn({
        let app = app.clone();
        let req = request(Method::POST, &uri, Some(ALICE), Some(json!({ "content": "one" })));
        async move { app.oneshot(req).await.unwrap().status() }
    });
    // Wait until the first turn holds the chat.
    while !state.orchestrator.leases().is_active(&chat) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let (status, body) = send_json(
        &app,
        request(Method::POST, &uri, Some(ALICE), Some(json!({ "content": "two" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    assert_eq!(first.await.unwrap(), StatusCode::OK);
    let stored = state.store().list_messages(&chat).await.unwrap();
    let contents: Vec<_> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["one", "slow"]);
}
