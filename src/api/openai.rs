//! OpenAI-dialect ingress — the native surface, passthrough to the
//! dispatcher.

use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::Value;

use crate::dispatch::{dispatch_chat, DispatchOutcome, RequestContext};
use crate::error::GatewayError;
use crate::state::AppState;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    match dispatch_chat(&state, body, ctx).await? {
        DispatchOutcome::Json(value) => Ok(Json(value).into_response()),
        DispatchOutcome::Stream(stream) => Ok(sse_response(stream)),
    }
}

/// Wrap an SSE byte stream in the standard streaming response headers.
pub fn sse_response(stream: crate::dispatch::ByteStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        axum::body::Body::from_stream(stream),
    )
        .into_response()
}
