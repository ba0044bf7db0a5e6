//! Gemini generateContent ingress shim.
//!
//! Handles `POST /v1(beta)?/models/{model}:generateContent` and
//! `:streamGenerateContent`. The `{model}:{action}` pair arrives as one
//! path segment and is split here; unknown actions are 404s.
//!
//! Translation notes:
//! - `system_instruction` parts merge into a leading system message;
//! - `contents[].role` `"model"` maps to `"assistant"`;
//! - `inline_data` parts become `image_url` data URLs;
//! - `tools[].function_declarations` become OpenAI tool definitions;
//! - responses are rebuilt as `candidates` + `usage_metadata`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::{dispatch_chat, ByteStream, DispatchOutcome, RequestContext};
use crate::error::GatewayError;
use crate::sse::SseParser;
use crate::state::AppState;

use super::openai::sse_response;

/// `POST /v1/models/{model_action}` and `POST /v1beta/models/{model_action}`
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let (model, action) = model_action
        .split_once(':')
        .ok_or_else(|| GatewayError::Validation("expected {model}:{action} in path".into()))?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(GatewayError::Validation(format!(
                "unsupported action `{other}`"
            )))
        }
    };

    let internal = to_internal(model, stream, body)?;
    match dispatch_chat(&state, internal, ctx).await? {
        DispatchOutcome::Json(value) => Ok(Json(from_internal(value)).into_response()),
        DispatchOutcome::Stream(upstream) => Ok(sse_response(translate_stream(upstream))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request translation
// ─────────────────────────────────────────────────────────────────────────────

fn parts_to_content(parts: Option<&Value>) -> Value {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return Value::String(String::new());
    };
    let mut blocks: Vec<Value> = Vec::new();
    let mut only_text = true;
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            blocks.push(json!({ "type": "text", "text": text }));
        } else if let Some(inline) = part.get("inline_data").or_else(|| part.get("inlineData")) {
            only_text = false;
            let mime = inline
                .get("mime_type")
                .or_else(|| inline.get("mimeType"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
            blocks.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{data}") },
            }));
        }
    }
    if only_text {
        // Collapse pure-text parts into a plain string.
        let text: String = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        Value::String(text)
    } else {
        Value::Array(blocks)
    }
}

pub(crate) fn to_internal(model: &str, stream: bool, body: Value) -> Result<Value, GatewayError> {
    let contents = body
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Validation("`contents` array is required".into()))?;

    let mut messages: Vec<Value> = Vec::with_capacity(contents.len() + 1);

    let system = body
        .get("system_instruction")
        .or_else(|| body.get("systemInstruction"));
    if let Some(system) = system {
        let content = parts_to_content(system.get("parts"));
        if content != Value::String(String::new()) {
            messages.push(json!({ "role": "system", "content": content }));
        }
    }

    for entry in contents {
        let role = match entry.get("role").and_then(Value::as_str) {
            Some("model") => "assistant",
            Some(role) => role,
            None => "user",
        };
        messages.push(json!({
            "role": role,
            "content": parts_to_content(entry.get("parts")),
        }));
    }

    let mut internal = json!({ "model": model, "messages": messages, "stream": stream });
    let obj = internal.as_object_mut().expect("object literal");

    let config = body
        .get("generation_config")
        .or_else(|| body.get("generationConfig"));
    if let Some(config) = config {
        if let Some(max) = config
            .get("max_output_tokens")
            .or_else(|| config.get("maxOutputTokens"))
            .and_then(Value::as_u64)
        {
            obj.insert("max_tokens".to_string(), json!(max));
        }
        if let Some(temp) = config.get("temperature").and_then(Value::as_f64) {
            obj.insert("temperature".to_string(), json!(temp));
        }
        if let Some(top_p) = config
            .get("top_p")
            .or_else(|| config.get("topP"))
            .and_then(Value::as_f64)
        {
            obj.insert("top_p".to_string(), json!(top_p));
        }
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                t.get("function_declarations")
                    .or_else(|| t.get("functionDeclarations"))
                    .and_then(Value::as_array)
            })
            .flatten()
            .map(|decl| {
                json!({
                    "type": "function",
                    "function": {
                        "name": decl.get("name").cloned().unwrap_or(Value::Null),
                        "description": decl.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": decl.get("parameters").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect();
        if !declarations.is_empty() {
            obj.insert("tools".to_string(), Value::Array(declarations));
        }
    }

    Ok(internal)
}

// ─────────────────────────────────────────────────────────────────────────────
// Response translation
// ─────────────────────────────────────────────────────────────────────────────

fn map_finish_reason(finish: Option<&str>) -> &'static str {
    match finish {
        Some("length") => "MAX_TOKENS",
        Some("content_filter") => "SAFETY",
        _ => "STOP",
    }
}

pub(crate) fn from_internal(resp: Value) -> Value {
    let text = resp
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let finish = resp
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str);

    let prompt = resp
        .pointer("/usage/prompt_tokens")
        .cloned()
        .unwrap_or(json!(0));
    let completion = resp
        .pointer("/usage/completion_tokens")
        .cloned()
        .unwrap_or(json!(0));
    let total = resp
        .pointer("/usage/total_tokens")
        .cloned()
        .unwrap_or(json!(0));

    let mut out = json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }], "role": "model" },
            "finish_reason": map_finish_reason(finish),
            "safety_ratings": [],
        }],
        "usage_metadata": {
            "promptTokenCount": prompt,
            "candidatesTokenCount": completion,
            "totalTokenCount": total,
        },
    });
    if let Some(summary) = resp.get("smart_ai_router") {
        out["smart_ai_router"] = summary.clone();
    }
    out
}

/// Re-emit the internal chunk stream as Gemini streaming frames. Gemini
/// streams have no `[DONE]` terminator; the summary frame is forwarded
/// verbatim before the stream closes.
fn translate_stream(upstream: ByteStream) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut parser = SseParser::new();

        'outer: while let Some(item) = upstream.next().await {
            let Ok(chunk) = item else { break };
            for event in parser.push(&chunk) {
                let raw = match event {
                    crate::sse::SseEvent::Chunk { raw, .. } => raw,
                    crate::sse::SseEvent::UpstreamError { code, message, .. } => {
                        let frame = json!({ "error": { "code": code, "message": message } });
                        if tx
                            .send(Ok(Bytes::from(format!("data: {frame}\n\n"))))
                            .await
                            .is_err()
                        {
                            break 'outer;
                        }
                        continue;
                    }
                    crate::sse::SseEvent::Done => continue,
                };
                let Some(json) = frame_json(&raw) else { continue };

                if json.get("smart_ai_router").is_some() {
                    let frame = json!({ "smart_ai_router": json["smart_ai_router"] });
                    if tx
                        .send(Ok(Bytes::from(format!("data: {frame}\n\n"))))
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                    continue;
                }
                let Some(text) = json
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                else {
                    continue;
                };
                let frame = json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": text }], "role": "model" },
                    }],
                });
                if tx
                    .send(Ok(Bytes::from(format!("data: {frame}\n\n"))))
                    .await
                    .is_err()
                {
                    break 'outer;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

fn frame_json(raw: &Bytes) -> Option<Value> {
    let text = std::str::from_utf8(raw).ok()?;
    let data: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    serde_json::from_str(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // to_internal
    // -----------------------------------------------------------------------

    #[test]
    fn contents_and_system_instruction_map_to_messages() {
        let out = to_internal(
            "gemini-pro",
            false,
            json!({
                "system_instruction": { "parts": [{ "text": "Be brief." }] },
                "contents": [
                    { "role": "user", "parts": [{ "text": "hi" }] },
                    { "role": "model", "parts": [{ "text": "hello" }] },
                    { "role": "user", "parts": [{ "text": "more" }] },
                ],
            }),
        )
        .unwrap();
        assert_eq!(out["model"], "gemini-pro");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "hello");
    }

    #[test]
    fn generation_config_maps_both_naming_styles() {
        let snake = to_internal(
            "m",
            false,
            json!({
                "contents": [{ "parts": [{ "text": "x" }] }],
                "generation_config": { "max_output_tokens": 128, "temperature": 0.5 },
            }),
        )
        .unwrap();
        assert_eq!(snake["max_tokens"], 128);

        let camel = to_internal(
            "m",
            false,
            json!({
                "contents": [{ "parts": [{ "text": "x" }] }],
                "generationConfig": { "maxOutputTokens": 64 },
            }),
        )
        .unwrap();
        assert_eq!(camel["max_tokens"], 64);
    }

    #[test]
    fn function_declarations_become_tools() {
        let out = to_internal(
            "m",
            false,
            json!({
                "contents": [{ "parts": [{ "text": "x" }] }],
                "tools": [{
                    "function_declarations": [{
                        "name": "lookup",
                        "description": "Find things",
                        "parameters": { "type": "object" },
                    }],
                }],
            }),
        )
        .unwrap();
        assert_eq!(out["tools"][0]["type"], "function");
        assert_eq!(out["tools"][0]["function"]["name"], "lookup");
    }

    #[test]
    fn inline_data_becomes_image_url() {
        let out = to_internal(
            "m",
            false,
            json!({
                "contents": [{
                    "parts": [
                        { "text": "what is this" },
                        { "inline_data": { "mime_type": "image/png", "data": "AAAA" } },
                    ],
                }],
            }),
        )
        .unwrap();
        let parts = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn missing_contents_is_validation_error() {
        assert!(to_internal("m", false, json!({})).is_err());
    }

    // -----------------------------------------------------------------------
    // from_internal
    // -----------------------------------------------------------------------

    #[test]
    fn response_is_rebuilt_with_candidates_and_usage() {
        let out = from_internal(json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Hi there" },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7 },
            "smart_ai_router": { "request_id": "r1" },
        }));
        assert_eq!(out["candidates"][0]["content"]["parts"][0]["text"], "Hi there");
        assert_eq!(out["candidates"][0]["content"]["role"], "model");
        assert_eq!(out["candidates"][0]["finish_reason"], "STOP");
        assert_eq!(out["usage_metadata"]["promptTokenCount"], 5);
        assert_eq!(out["usage_metadata"]["candidatesTokenCount"], 2);
        assert_eq!(out["smart_ai_router"]["request_id"], "r1");
    }

    #[test]
    fn length_maps_to_max_tokens_finish() {
        let out = from_internal(json!({
            "choices": [{
                "message": { "content": "…" },
                "finish_reason": "length",
            }],
        }));
        assert_eq!(out["candidates"][0]["finish_reason"], "MAX_TOKENS");
    }

    // -----------------------------------------------------------------------
    // Stream translation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stream_translates_deltas_and_forwards_summary() {
        let frames = vec![
            "data: {\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n".to_string(),
            "data: {\"id\":\"summary-1\",\"choices\":[{\"index\":0,\"delta\":{}}],\"smart_ai_router\":{\"request_id\":\"r1\"}}\n\n".to_string(),
            "data: [DONE]\n\n".to_string(),
        ];
        let upstream: ByteStream = Box::pin(futures_util::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<Bytes, std::io::Error>(Bytes::from(f)))
                .collect::<Vec<_>>(),
        ));
        let text: String = translate_stream(upstream)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .collect();

        assert!(text.contains("\"text\":\"Hi\""));
        assert!(text.contains("\"role\":\"model\""));
        assert!(text.contains("\"smart_ai_router\":{\"request_id\":\"r1\"}"));
        assert!(!text.contains("[DONE]"), "gemini streams have no DONE marker");
    }
}
