//! Chat CRUD: list, create, fetch with history, delete.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chatterbox_core::{Chat, ChatStore, ChatSummary, DEFAULT_CHAT_TITLE, Message};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::Owner;
use crate::schemas::chat::{
    ChatDetailResponse, ChatListResponse, ChatResponse, ChatWithMessages, CreateChatRequest,
    DeleteChatResponse, ErrorResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_chats, create_chat, get_chat, delete_chat),
    components(schemas(
        Chat,
        ChatSummary,
        Message,
        CreateChatRequest,
        ChatListResponse,
        ChatResponse,
        ChatWithMessages,
        ChatDetailResponse,
        DeleteChatResponse,
        ErrorResponse
    ))
)]
pub struct ChatApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", get(list_chats).post(create_chat))
        .route("/chat/{id}", get(get_chat).delete(delete_chat))
}

#[utoipa::path(
    get,
    path = "/api/chat",
    tag = "chat",
    responses(
        (status = 200, description = "Caller's chats, most recently active first", body = ChatListResponse),
        (status = 401, description = "Missing or unknown token", body = ErrorResponse),
    )
)]
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
) -> Result<Json<ChatListResponse>, ServerError> {
    let chats = state.store().list_chats(&owner).await?;
    Ok(Json(ChatListResponse { chats }))
}

#[utoipa::path(
    post,
    path = "/api/chat",
    tag = "chat",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created", body = ChatResponse),
        (status = 400, description = "Malformed body", body = ErrorResponse),
        (status = 401, description = "Missing or unknown token", body = ErrorResponse),
    )
)]
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    payload: Result<Option<Json<CreateChatRequest>>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatResponse>), ServerError> {
    // A missing body is fine; a malformed one is not.
    let req = payload?.map(|Json(r)| r).unwrap_or_default();
    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_CHAT_TITLE);

    let chat = state.store().create_chat(&owner, title).await?;
    info!(chat_id = %chat.id, %owner, "chat created");
    Ok((StatusCode::CREATED, Json(ChatResponse { chat })))
}

#[utoipa::path(
    get,
    path = "/api/chat/{id}",
    tag = "chat",
    params(("id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Chat with its messages, oldest first", body = ChatDetailResponse),
        (status = 404, description = "No such chat for this caller", body = ErrorResponse),
    )
)]
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<ChatDetailResponse>, ServerError> {
    let chat = find_owned(&state, &id, &owner).await?;
    let messages = state.store().list_messages(&chat.id).await?;
    Ok(Json(ChatDetailResponse {
        chat: ChatWithMessages::new(chat, messages),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/chat/{id}",
    tag = "chat",
    params(("id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Chat and its messages deleted", body = DeleteChatResponse),
        (status = 404, description = "No such chat for this caller", body = ErrorResponse),
    )
)]
pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<DeleteChatResponse>, ServerError> {
    let chat = find_owned(&state, &id, &owner).await?;
    state.store().delete_chat(&chat.id).await?;
    info!(chat_id = %chat.id, %owner, "chat deleted");
    Ok(Json(DeleteChatResponse { success: true }))
}

async fn find_owned(state: &AppState, id: &str, owner: &str) -> Result<Chat, ServerError> {
    state
        .store()
        .find_chat_for_owner(id, owner)
        .await?
        .ok_or_else(|| ServerError::NotFound("Chat not found".to_owned()))
}
