//! Chat handlers
//! Handles POST /api/chat and POST /api/chat/stream

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ChatError, GENERIC_ERROR_MESSAGE};
use crate::proxy::mappers::history::HistoryEntry;
use crate::proxy::server::AppState;
use crate::proxy::service::ChatInput;

/// Inbound body: `{ message?, imageBase64?, history? }`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    /// Kept loose: clients send several history shapes.
    #[serde(default)]
    pub history: Option<Value>,
}

impl ChatRequestBody {
    /// Parse the raw body. Content-Type is not checked; clients post JSON
    /// under several content types.
    pub fn parse(raw: &[u8]) -> Result<Self, ChatError> {
        serde_json::from_slice(raw).map_err(|e| ChatError::InvalidBody(e.to_string()))
    }

    pub fn into_input(self) -> ChatInput {
        ChatInput {
            history: HistoryEntry::collect(self.history.as_ref()),
            message: self.message,
            image: self.image_base64,
        }
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Handle POST /api/chat
pub async fn handle_chat(State(state): State<AppState>, raw: Bytes) -> Response {
    let trace_id = new_trace_id();

    let body = match ChatRequestBody::parse(&raw) {
        Ok(b) => b,
        Err(e) => return error_response(&trace_id, &e, state.expose_error_details),
    };

    match state.chat.reply(&trace_id, body.into_input()).await {
        Ok(reply) => Json(json!({ "reply": reply })).into_response(),
        Err(e) => error_response(&trace_id, &e, state.expose_error_details),
    }
}

/// Handle POST /api/chat/stream
///
/// Plain-text chunked body made of decoded fragments. Failures before the
/// upstream accepted the call get the regular JSON error response.
pub async fn handle_chat_stream(State(state): State<AppState>, raw: Bytes) -> Response {
    let trace_id = new_trace_id();

    let body = match ChatRequestBody::parse(&raw) {
        Ok(b) => b,
        Err(e) => return error_response(&trace_id, &e, state.expose_error_details),
    };

    let fragments = match state.chat.reply_stream(&trace_id, body.into_input()).await {
        Ok(f) => f,
        Err(e) => return error_response(&trace_id, &e, state.expose_error_details),
    };

    let body_stream = fragments.map(|item| -> Result<Bytes, std::io::Error> {
        match item {
            Ok(text) => Ok(Bytes::from(text)),
            Err(_) => Ok(Bytes::from_static(GENERIC_ERROR_MESSAGE.as_bytes())),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|e| {
            tracing::error!("[{}] Failed to build streaming response: {}", trace_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Structured JSON error. `details` only when the policy allows it.
pub fn error_response(trace_id: &str, err: &ChatError, expose_details: bool) -> Response {
    let status = err.status();
    if status.is_server_error() {
        tracing::error!("[{}] Chat failed: {}", trace_id, err);
    } else {
        tracing::warn!("[{}] Chat rejected: {}", trace_id, err);
    }

    let mut body = json!({ "error": err.user_message() });
    if expose_details {
        if let Some(details) = err.details() {
            body["details"] = json!(details);
        }
    }

    let mut response = (status, Json(body)).into_response();
    if matches!(err, ChatError::RateLimited { .. }) {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(err.retry_after_secs()));
    }
    response
}
