pub mod chat;
pub mod message;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/api` that require an [`Owner`](crate::middleware::Owner).
pub fn router() -> Router<Arc<AppState>> {
    Router::new().merge(chat::router()).merge(message::router())
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut spec = chat::ChatApi::openapi();
    spec.merge(message::MessageApi::openapi());
    spec
}
