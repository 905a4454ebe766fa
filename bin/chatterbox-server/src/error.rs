//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body of the form
//! `{"error": "<message>"}` with a matching status code.
//!
//! Internal errors are logged with full detail; clients only ever see a
//! generic message.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatterbox_core::{StoreError, TurnError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    /// A turn ended before both messages were stored.
    #[error(transparent)]
    Turn(#[from] TurnError),

    /// Propagated from the chat store outside of a turn.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or unknown bearer token.
    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_owned()),

            ServerError::Turn(e) => match e {
                TurnError::Validation(_) => (StatusCode::BAD_REQUEST, e.client_message()),
                TurnError::NotFound => (StatusCode::NOT_FOUND, e.client_message()),
                TurnError::Busy(_) => (StatusCode::CONFLICT, e.client_message()),
                TurnError::Generation(source) => {
                    warn!(error = %source, "model generation failed");
                    (
                        StatusCode::BAD_GATEWAY,
                        "Failed to generate AI response".to_owned(),
                    )
                }
                TurnError::Persistence { phase, source } => {
                    error!(%phase, error = %source, "turn persistence failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, e.client_message())
                }
            },

            ServerError::Store(e) => {
                error!(error = %e, "store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
