//! Anthropic Messages ingress shim.
//!
//! Translates `/v1/messages` traffic to and from the internal OpenAI-shaped
//! request so the routing core stays dialect-agnostic.
//!
//! # Protocol differences handled here
//!
//! | Concern | Anthropic | Internal |
//! |---|---|---|
//! | System prompt | top-level `system` | first message with `role: "system"` |
//! | Tools | `tools[].input_schema` | `tools[].function.parameters` |
//! | Images | `source: {type: base64, …}` blocks | `image_url` data URLs |
//! | Finish reasons | `end_turn` / `max_tokens` / `tool_use` | `stop` / `length` / `tool_calls` |
//! | Stream | typed events (`message_start`…) | `chat.completion.chunk` frames |
//!
//! The `anthropic-version` header is required and pinned; other versions
//! are rejected with 400 rather than silently translated wrong.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::dispatch::{dispatch_chat, ByteStream, DispatchOutcome, RequestContext};
use crate::error::GatewayError;
use crate::sse::SseParser;
use crate::state::AppState;

use super::openai::sse_response;

const SUPPORTED_VERSION: &str = "2023-06-01";

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    match headers.get("anthropic-version").and_then(|v| v.to_str().ok()) {
        Some(SUPPORTED_VERSION) => {}
        Some(other) => {
            return Err(GatewayError::Validation(format!(
                "unsupported anthropic-version `{other}` (expected {SUPPORTED_VERSION})"
            )))
        }
        None => {
            return Err(GatewayError::Validation(
                "anthropic-version header is required".into(),
            ))
        }
    }

    let internal = to_internal(body)?;
    match dispatch_chat(&state, internal, ctx).await? {
        DispatchOutcome::Json(value) => Ok(Json(from_internal(value)).into_response()),
        DispatchOutcome::Stream(stream) => Ok(sse_response(translate_stream(stream))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request translation — pub(crate) for unit testing
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn to_internal(body: Value) -> Result<Value, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Validation("`model` field is required".into()))?
        .to_string();
    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Validation("`messages` array is required".into()))?;

    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len() + 1);

    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for message in raw_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = translate_content_in(message.get("content"));
        messages.push(json!({ "role": role, "content": content }));
    }

    let mut internal = json!({ "model": model, "messages": messages });
    let obj = internal.as_object_mut().expect("object literal");

    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(value) = body.get(key).filter(|v| !v.is_null()) {
            obj.insert(key.to_string(), value.clone());
        }
    }
    if let Some(stop) = body.get("stop_sequences").filter(|v| !v.is_null()) {
        obj.insert("stop".to_string(), stop.clone());
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let translated: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect();
        if !translated.is_empty() {
            obj.insert("tools".to_string(), Value::Array(translated));
        }
    }
    if let Some(choice) = body.get("tool_choice") {
        let translated = match choice.get("type").and_then(Value::as_str) {
            Some("auto") => json!("auto"),
            Some("any") => json!("required"),
            Some("tool") => json!({
                "type": "function",
                "function": { "name": choice.get("name").cloned().unwrap_or(Value::Null) },
            }),
            _ => Value::Null,
        };
        if !translated.is_null() {
            obj.insert("tool_choice".to_string(), translated);
        }
    }

    Ok(internal)
}

/// Anthropic content (string or typed blocks) → internal content.
fn translate_content_in(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Array(blocks)) => {
            let parts: Vec<Value> = blocks
                .iter()
                .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                    Some("text") => Some(json!({
                        "type": "text",
                        "text": block.get("text").cloned().unwrap_or(Value::Null),
                    })),
                    Some("image") => {
                        let source = block.get("source")?;
                        let media_type = source
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png");
                        let data = source.get("data").and_then(Value::as_str)?;
                        Some(json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{media_type};base64,{data}") },
                        }))
                    }
                    _ => None,
                })
                .collect();
            Value::Array(parts)
        }
        _ => Value::String(String::new()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response translation
// ─────────────────────────────────────────────────────────────────────────────

fn map_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

pub(crate) fn from_internal(resp: Value) -> Value {
    let message = resp.pointer("/choices/0/message");
    let mut content: Vec<Value> = Vec::new();

    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
    {
        content.push(json!({ "type": "text", "text": text }));
    }
    if let Some(tool_calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
    {
        for call in tool_calls {
            let arguments = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                "input": arguments,
            }));
        }
    }

    let finish_reason = resp
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str);

    let mut out = json!({
        "id": resp.get("id").and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "content": content,
        "stop_reason": map_stop_reason(finish_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": resp.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": resp.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
        },
    });
    if let Some(summary) = resp.get("smart_ai_router") {
        out["smart_ai_router"] = summary.clone();
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream translation
// ─────────────────────────────────────────────────────────────────────────────

fn event_frame(event_type: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {event_type}\ndata: {data}\n\n"))
}

/// Extract the JSON payload of one internal SSE frame.
fn frame_json(raw: &Bytes) -> Option<Value> {
    let text = std::str::from_utf8(raw).ok()?;
    let data: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    serde_json::from_str(&data).ok()
}

/// Re-emit the internal OpenAI-chunk stream as Anthropic stream events:
/// `message_start`, `content_block_start`, `content_block_delta`…,
/// `content_block_stop`, `message_delta` (carrying usage and the routing
/// summary), `message_stop`.
fn translate_stream(upstream: ByteStream) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut parser = SseParser::new();
        let mut started = false;
        let mut output_tokens: u64 = 0;
        let mut summary: Option<Value> = None;
        let mut error: Option<Value> = None;
        let message_id = format!("msg_{}", Uuid::new_v4().simple());

        'outer: while let Some(item) = upstream.next().await {
            let Ok(chunk) = item else { break };
            for event in parser.push(&chunk) {
                let (raw, usage) = match event {
                    crate::sse::SseEvent::Chunk { raw, usage, .. } => (raw, usage),
                    crate::sse::SseEvent::UpstreamError { code, message, .. } => {
                        error = Some(json!({ "code": code, "message": message }));
                        continue;
                    }
                    crate::sse::SseEvent::Done => continue,
                };
                let Some(json) = frame_json(&raw) else { continue };

                if let Some(u) = usage {
                    output_tokens = u.completion_tokens;
                }
                if let Some(s) = json.get("smart_ai_router") {
                    summary = Some(s.clone());
                    continue;
                }

                let model = json.get("model").cloned().unwrap_or(Value::Null);
                if !started {
                    started = true;
                    let start = json!({
                        "type": "message_start",
                        "message": {
                            "id": message_id.as_str(),
                            "type": "message",
                            "role": "assistant",
                            "model": model,
                            "content": [],
                            "stop_reason": Value::Null,
                            "usage": { "input_tokens": 0, "output_tokens": 0 },
                        },
                    });
                    if tx.send(Ok(event_frame("message_start", &start))).await.is_err() {
                        break 'outer;
                    }
                    let block_start = json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": { "type": "text", "text": "" },
                    });
                    if tx
                        .send(Ok(event_frame("content_block_start", &block_start)))
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }

                if let Some(text) = json
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                {
                    let delta = json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": { "type": "text_delta", "text": text },
                    });
                    if tx
                        .send(Ok(event_frame("content_block_delta", &delta)))
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }
            }
        }

        if started {
            let stop = json!({ "type": "content_block_stop", "index": 0 });
            let _ = tx.send(Ok(event_frame("content_block_stop", &stop))).await;
        }
        let mut delta = json!({
            "type": "message_delta",
            "delta": { "stop_reason": "end_turn", "stop_sequence": Value::Null },
            "usage": { "output_tokens": output_tokens },
        });
        if let Some(summary) = summary {
            delta["smart_ai_router"] = summary;
        }
        if let Some(error) = error {
            delta["error"] = error;
            delta["delta"]["stop_reason"] = json!("error");
        }
        let _ = tx.send(Ok(event_frame("message_delta", &delta))).await;
        let stop = json!({ "type": "message_stop" });
        let _ = tx.send(Ok(event_frame("message_stop", &stop))).await;
    });

    Box::pin(ReceiverStream::new(rx))
}
