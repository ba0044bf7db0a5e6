//! Core routing types shared across the pipeline.

use serde_json::Value;

use crate::config::ChannelConfig;
use crate::error::GatewayError;

/// A capability the request requires from the serving model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vision,
    FunctionCalling,
    Streaming,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::FunctionCalling => "function_calling",
            Self::Streaming => "streaming",
        }
    }
}

/// How the request's `model` field resolves to candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelector {
    /// A concrete model id.
    Exact(String),
    /// `tag:a,b` — lowercase tag set, all required.
    Tags(Vec<String>),
    /// `auto:<strategy>` — every enabled channel's default model.
    Auto(String),
}

impl ModelSelector {
    pub fn parse(model: &str) -> Self {
        if let Some(tags) = model.strip_prefix("tag:") {
            let tags: Vec<String> = tags
                .split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            return Self::Tags(tags);
        }
        if let Some(strategy) = model.strip_prefix("auto:") {
            return Self::Auto(strategy.trim().to_string());
        }
        Self::Exact(model.to_string())
    }
}

/// A chat request normalised to the internal (OpenAI-shaped) form, with the
/// routing-relevant fields lifted out of the payload once.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub model: String,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    /// Strategy requested via `auto:<name>`, if any.
    pub strategy: Option<String>,
    pub required_capabilities: Vec<Capability>,
    /// Rough context-window lower bound: input-length/4 + max_tokens.
    pub min_context_length: u64,
    pub has_functions: bool,
    /// The normalised body, forwarded (with `model` rewritten) upstream.
    pub payload: Value,
}

impl RoutingRequest {
    /// Lift routing fields out of a normalised OpenAI-format payload.
    pub fn from_payload(payload: Value) -> Result<Self, GatewayError> {
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Validation("`model` field is required".into()))?
            .to_string();
        let messages = payload
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Validation("`messages` array is required".into()))?;
        if messages.is_empty() {
            return Err(GatewayError::Validation("`messages` must not be empty".into()));
        }

        let stream = payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let max_tokens = payload.get("max_tokens").and_then(Value::as_u64);
        let temperature = payload.get("temperature").and_then(Value::as_f64);
        let has_functions = ["tools", "functions", "tool_choice", "function_call"]
            .iter()
            .any(|key| payload.get(key).is_some_and(|v| !v.is_null()));

        let mut required = Vec::new();
        if messages_request_vision(messages) {
            required.push(Capability::Vision);
        }
        if has_functions {
            required.push(Capability::FunctionCalling);
        }
        if stream {
            required.push(Capability::Streaming);
        }

        let input_len: usize = messages.iter().map(text_len_of_message).sum();
        let min_context_length = (input_len as u64) / 4 + max_tokens.unwrap_or(0);

        let strategy = match ModelSelector::parse(&model) {
            ModelSelector::Auto(s) => Some(s),
            _ => None,
        };

        Ok(Self {
            model,
            stream,
            max_tokens,
            temperature,
            strategy,
            required_capabilities: required,
            min_context_length,
            has_functions,
            payload,
        })
    }

    pub fn selector(&self) -> ModelSelector {
        ModelSelector::parse(&self.model)
    }

    pub fn messages(&self) -> &[Value] {
        self.payload
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn messages_request_vision(messages: &[Value]) -> bool {
    messages.iter().any(|m| {
        m.get("content")
            .and_then(Value::as_array)
            .is_some_and(|parts| {
                parts
                    .iter()
                    .any(|p| p.get("type").and_then(Value::as_str) == Some("image_url"))
            })
    })
}

fn text_len_of_message(message: &Value) -> usize {
    match message.get("content") {
        Some(Value::String(s)) => s.len(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .map(str::len)
            .sum(),
        _ => 0,
    }
}

/// One (channel, concrete model) pair produced by candidate discovery.
#[derive(Debug, Clone)]
pub struct ChannelCandidate {
    pub channel: ChannelConfig,
    pub matched_model: String,
}

/// A fully scored candidate, ready for the failover loop.
#[derive(Debug, Clone)]
pub struct RoutingScore {
    pub channel: ChannelConfig,
    pub matched_model: String,
    pub cost_score: f64,
    pub speed_score: f64,
    pub quality_score: f64,
    pub reliability_score: f64,
    pub parameter_score: f64,
    pub context_score: f64,
    pub free_score: f64,
    pub local_score: f64,
    pub total_score: f64,
    pub reason: String,
}

impl RoutingScore {
    /// The per-dimension breakdown for the summary event.
    pub fn scores_json(&self) -> Value {
        serde_json::json!({
            "cost": round3(self.cost_score),
            "speed": round3(self.speed_score),
            "quality": round3(self.quality_score),
            "reliability": round3(self.reliability_score),
            "parameter": round3(self.parameter_score),
            "context": round3(self.context_score),
            "free": round3(self.free_score),
            "local": round3(self.local_score),
        })
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_parsing() {
        assert_eq!(
            ModelSelector::parse("gpt-4o-mini"),
            ModelSelector::Exact("gpt-4o-mini".into())
        );
        assert_eq!(
            ModelSelector::parse("tag:Free, Vision"),
            ModelSelector::Tags(vec!["free".into(), "vision".into()])
        );
        assert_eq!(
            ModelSelector::parse("auto:balanced"),
            ModelSelector::Auto("balanced".into())
        );
    }

    #[test]
    fn from_payload_requires_model_and_messages() {
        assert!(RoutingRequest::from_payload(json!({ "messages": [] })).is_err());
        assert!(RoutingRequest::from_payload(json!({ "model": "x" })).is_err());
        assert!(RoutingRequest::from_payload(json!({ "model": "x", "messages": [] })).is_err());
    }

    #[test]
    fn vision_capability_detected_from_image_parts() {
        let request = RoutingRequest::from_payload(json!({
            "model": "tag:vision",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "what is this?" },
                    { "type": "image_url", "image_url": { "url": "https://x/cat.png" } },
                ]
            }]
        }))
        .unwrap();
        assert!(request.required_capabilities.contains(&Capability::Vision));
    }

    #[test]
    fn function_calling_detected_from_any_tool_field() {
        for key in ["tools", "functions", "tool_choice", "function_call"] {
            let request = RoutingRequest::from_payload(json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                key: [{}],
            }))
            .unwrap();
            assert!(
                request.required_capabilities.contains(&Capability::FunctionCalling),
                "field `{key}` must imply function calling"
            );
            assert!(request.has_functions);
        }
    }

    #[test]
    fn streaming_capability_follows_stream_flag() {
        let request = RoutingRequest::from_payload(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true,
        }))
        .unwrap();
        assert!(request.stream);
        assert!(request.required_capabilities.contains(&Capability::Streaming));
    }

    #[test]
    fn min_context_combines_input_length_and_max_tokens() {
        let text = "x".repeat(400);
        let request = RoutingRequest::from_payload(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": text }],
            "max_tokens": 1000,
        }))
        .unwrap();
        // 400 chars / 4 + 1000 = 1100
        assert_eq!(request.min_context_length, 1100);
    }

    #[test]
    fn auto_selector_carries_strategy() {
        let request = RoutingRequest::from_payload(json!({
            "model": "auto:cost_first",
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .unwrap();
        assert_eq!(request.strategy.as_deref(), Some("cost_first"));
    }
}
