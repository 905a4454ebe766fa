//! Turn endpoints: send a message and receive the assistant reply, either
//! as one JSON response or as a server-sent-event stream.
//!
//! Both handlers run the turn on its own task, so a client that goes away
//! mid-turn does not cancel persistence of the reply.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use chatterbox_core::TurnEvent;
use futures::{Stream, StreamExt};
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::Owner;
use crate::schemas::chat::{ErrorResponse, SendMessageRequest, TurnResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(send_message, send_message_stream),
    components(schemas(SendMessageRequest, TurnResponse, TurnEvent, ErrorResponse))
)]
pub struct MessageApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/{id}/message", post(send_message))
        .route("/chat/{id}/message/stream", post(send_message_stream))
}

#[utoipa::path(
    post,
    path = "/api/chat/{id}/message",
    tag = "message",
    params(("id" = String, Path, description = "Chat id")),
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Both persisted messages", body = TurnResponse),
        (status = 400, description = "Empty or oversized content", body = ErrorResponse),
        (status = 404, description = "No such chat for this caller", body = ErrorResponse),
        (status = 409, description = "A reply is already being generated for this chat", body = ErrorResponse),
        (status = 502, description = "Model failed; the user message is kept", body = ErrorResponse),
    )
)]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(chat_id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, ServerError> {
    let Json(req) = payload?;
    let orchestrator = state.orchestrator.clone();

    let outcome = tokio::spawn(async move {
        orchestrator
            .run_complete(&owner, &chat_id, &req.content)
            .await
    })
    .await
    .map_err(|e| ServerError::Internal(format!("turn task failed: {e}")))??;

    Ok(Json(TurnResponse {
        user_message: outcome.user_message,
        assistant_message: outcome.assistant_message,
    }))
}

/// Streams the turn as SSE frames:
///
/// ```text
/// event: message   data: {"type":"userMessage","message":{…}}
/// event: message   data: {"type":"chunk","content":"…"}      (zero or more)
/// event: message   data: {"type":"done","message":{…}}
///   or
/// event: error     data: {"type":"error","error":"…"}
/// ```
///
/// Failures before the user message is stored are returned as a plain JSON
/// error instead of a stream.
#[utoipa::path(
    post,
    path = "/api/chat/{id}/message/stream",
    tag = "message",
    params(("id" = String, Path, description = "Chat id")),
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "text/event-stream of turn events", body = TurnEvent, content_type = "text/event-stream"),
        (status = 400, description = "Empty or oversized content", body = ErrorResponse),
        (status = 404, description = "No such chat for this caller", body = ErrorResponse),
        (status = 409, description = "A reply is already being generated for this chat", body = ErrorResponse),
        (status = 500, description = "The user message could not be stored", body = ErrorResponse),
    )
)]
pub async fn send_message_stream(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(chat_id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let Json(req) = payload?;
    let turn = state
        .orchestrator
        .start_stream(&owner, &chat_id, &req.content)
        .await?;
    debug!(chat_id = %chat_id, message_id = %turn.user_message.id, "streaming turn opened");

    // Dropping the join handle detaches the task; it finishes on its own.
    drop(turn.task);
    let frames = turn
        .events
        .map(|event| Ok::<_, Infallible>(Event::from(event.to_frame())));
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}
