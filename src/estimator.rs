//! Pre-flight token and cost estimation.
//!
//! Everything here is a pure function of the request messages and channel
//! metadata — no I/O, no clocks — so repeated calls give identical results
//! and the routing cache can trust the numbers.
//!
//! Token counting uses the cl100k BPE when the encoder initialises, and
//! falls back to a character heuristic tuned for mixed CJK/Latin text:
//! `ceil(cjk_chars / 2 + other_chars / 4) + 50`.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Fixed overhead added by chat message framing.
const MESSAGE_OVERHEAD_TOKENS: usize = 50;

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// Expected answer length relative to a "moderate" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl Complexity {
    /// Output-token multiplier applied to the input estimate.
    pub fn output_multiplier(self) -> f64 {
        match self {
            Self::Simple => 0.5,
            Self::Moderate => 1.0,
            Self::Complex => 2.0,
            Self::Expert => 3.0,
        }
    }
}

/// Concatenate the text content of every message. Multimodal parts count
/// only their text; image payloads are priced by the upstream, not here.
fn collect_text(messages: &[Value]) -> String {
    let mut text = String::new();
    for message in messages {
        match message.get("content") {
            Some(Value::String(s)) => text.push_str(s),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(s) = part.get("text").and_then(Value::as_str) {
                        text.push_str(s);
                    }
                }
            }
            _ => {}
        }
        text.push('\n');
    }
    text
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'          // CJK unified
        | '\u{3400}'..='\u{4dbf}'        // extension A
        | '\u{3040}'..='\u{30ff}'        // kana
        | '\u{ac00}'..='\u{d7af}'        // hangul
    )
}

/// Heuristic used when no BPE encoder is available.
fn heuristic_tokens(text: &str) -> usize {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let other = text.chars().count() - cjk;
    (cjk as f64 / 2.0 + other as f64 / 4.0).ceil() as usize + MESSAGE_OVERHEAD_TOKENS
}

/// Count input tokens for a message list.
pub fn estimate_input_tokens(messages: &[Value]) -> usize {
    let text = collect_text(messages);
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(&text).len() + MESSAGE_OVERHEAD_TOKENS,
        None => heuristic_tokens(&text),
    }
}

/// Bucket the request by keyword signals in the user text.
pub fn detect_complexity(messages: &[Value]) -> Complexity {
    let text = collect_text(messages).to_lowercase();

    const EXPERT: &[&str] = &[
        "prove", "theorem", "formal verification", "distributed consensus",
        "架构设计", "形式化",
    ];
    const COMPLEX: &[&str] = &[
        "analyze", "analyse", "design", "implement", "refactor", "architecture",
        "step by step", "详细分析", "设计",
    ];
    const SIMPLE: &[&str] = &[
        "hi", "hello", "thanks", "thank you", "translate", "what is", "你好", "谢谢",
    ];

    if EXPERT.iter().any(|k| text.contains(k)) {
        Complexity::Expert
    } else if COMPLEX.iter().any(|k| text.contains(k)) {
        Complexity::Complex
    } else if text.len() < 80 && SIMPLE.iter().any(|k| text.contains(k)) {
        Complexity::Simple
    } else {
        Complexity::Moderate
    }
}

/// A pre-flight projection for one candidate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CostEstimate {
    pub input_tokens: usize,
    pub estimated_output_tokens: usize,
    pub complexity: Complexity,
    /// Projected cost in the channel's recorded currency. Logging and
    /// recommendations only — routing ignores it unless a strategy opts in.
    pub estimated_cost: f64,
}

/// Project a request's cost against per-token prices.
///
/// `max_tokens`, when present, caps the output estimate.
pub fn estimate_cost(
    messages: &[Value],
    max_tokens: Option<u64>,
    input_price_per_token: f64,
    output_price_per_token: f64,
    exchange_rate: f64,
) -> CostEstimate {
    let input_tokens = estimate_input_tokens(messages);
    let complexity = detect_complexity(messages);
    let mut estimated_output = (input_tokens as f64 * complexity.output_multiplier()) as usize;
    if let Some(cap) = max_tokens {
        estimated_output = estimated_output.min(cap as usize);
    }
    let estimated_cost = (input_tokens as f64 * input_price_per_token
        + estimated_output as f64 * output_price_per_token)
        * exchange_rate;
    CostEstimate {
        input_tokens,
        estimated_output_tokens: estimated_output,
        complexity,
        estimated_cost,
    }
}
