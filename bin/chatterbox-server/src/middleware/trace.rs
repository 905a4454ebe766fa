use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, Limited};
use serde_json::json;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub static X_TRACE_ID: &str = "x-trace-id";

/// Request bodies above this size are refused before any handler runs.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// JSON request bodies up to this size are logged verbatim.
const MAX_LOGGED_BODY_BYTES: usize = 1024;

/// Per-request span with a propagated or fresh `x-trace-id`.
///
/// Request bodies are buffered so small JSON payloads can be logged.
/// Response bodies are passed through untouched: SSE streams must reach the
/// client as they are produced.
pub async fn trace_middleware(req: Request, next: Next) -> Response {
    let start_time = Instant::now();

    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    let trace_header = HeaderValue::from_str(&trace_id.to_string()).ok();

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        info!("→ request started");
        let (parts, body) = req.into_parts();
        let bytes = match Limited::new(body, MAX_REQUEST_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                info!(error = %e, "request body rejected");
                let body = Json(json!({ "error": "Request body too large" }));
                return (StatusCode::PAYLOAD_TOO_LARGE, body).into_response();
            }
        };
        log_body(&parts.headers, &bytes);

        let mut req = Request::from_parts(parts, Body::from(bytes));
        if let Some(value) = &trace_header {
            req.headers_mut().insert(X_TRACE_ID, value.clone());
        }

        let mut response = next.run(req).await;
        if let Some(value) = trace_header {
            response.headers_mut().insert(X_TRACE_ID, value);
        }

        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            "← response started"
        );
        response
    }
    .instrument(span)
    .await
}

fn log_body(headers: &HeaderMap, bytes: &Bytes) {
    if bytes.is_empty() {
        return;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match std::str::from_utf8(bytes) {
        Ok(text) if content_type.contains("application/json") && bytes.len() <= MAX_LOGGED_BODY_BYTES => {
            info!(body = %text, "request body");
        }
        _ => info!(content_type, size = bytes.len(), "request body [skipped]"),
    }
}
