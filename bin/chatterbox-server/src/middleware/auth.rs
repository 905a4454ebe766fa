//! Bearer-token identity.
//!
//! [`require_owner`] resolves `Authorization: Bearer <token>` against the
//! configured token map and stores the result as an [`Owner`] request
//! extension. Handlers take `Owner` as an extractor.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::config::ANONYMOUS_OWNER;
use crate::error::ServerError;
use crate::state::AppState;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

pub async fn require_owner(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let tokens = &state.config.api_tokens;
    let owner = if tokens.is_empty() {
        ANONYMOUS_OWNER.to_owned()
    } else {
        let provided = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        match provided.and_then(|token| tokens.get(token)) {
            Some(owner) => owner.clone(),
            None => {
                debug!(has_header = provided.is_some(), "rejecting unauthenticated request");
                return ServerError::Unauthorized.into_response();
            }
        }
    };

    req.extensions_mut().insert(Owner(owner));
    next.run(req).await
}

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Owner>()
            .cloned()
            .ok_or(ServerError::Unauthorized)
    }
}
