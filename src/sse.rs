//! Incremental SSE parser for upstream chat-completion streams.
//!
//! Upstream bytes arrive in arbitrary chunks; this parser reassembles
//! `data:` frames and classifies each one into a typed event so the
//! dispatcher can make transitions explicitly instead of grepping bytes:
//!
//! - [`SseEvent::Chunk`] — an ordinary frame, forwarded verbatim. Carries
//!   parsed token usage when the frame has a `usage` object (providers emit
//!   it on the final content chunk).
//! - [`SseEvent::UpstreamError`] — providers occasionally emit
//!   `data: {"error": …}` mid-stream instead of an HTTP error.
//! - [`SseEvent::Done`] — the `data: [DONE]` terminator.
//!
//! The parser owns no I/O; push bytes in, take events out.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Token counts reported by the upstream's final usage frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One classified frame from the upstream stream.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Chunk {
        /// The frame exactly as received (without the blank-line separator).
        raw: Bytes,
        usage: Option<TokenUsage>,
        /// Bytes of visible delta content in this frame (0 = none). Feeds
        /// the token-rate fallback when the upstream never reports usage.
        content_len: usize,
    },
    UpstreamError {
        code: Option<u16>,
        message: String,
        retry_after: Option<u64>,
    },
    Done,
}

/// Reassembles SSE frames from arbitrary byte chunks.
#[derive(Default)]
pub struct SseParser {
    buf: BytesMut,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(block) = self.next_block() {
            if let Some(event) = classify_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let block = self.buf.split().freeze();
        classify_block(&block).into_iter().collect()
    }

    /// Pop the next complete blank-line-terminated block from the buffer.
    /// Both `\n\n` and `\r\n\r\n` separators are recognised.
    fn next_block(&mut self) -> Option<Bytes> {
        let (boundary, sep_len) = {
            let buf = &self.buf[..];
            let mut found = None;
            for i in 0..buf.len().saturating_sub(1) {
                if buf[i] != b'\n' {
                    continue;
                }
                if buf[i + 1] == b'\n' {
                    found = Some((i, 2));
                    break;
                }
                if buf.len() > i + 2 && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                    found = Some((i, 3));
                    break;
                }
            }
            found?
        };
        let mut block = self.buf.split_to(boundary + sep_len);
        block.truncate(boundary);
        while block.last() == Some(&b'\r') {
            block.truncate(block.len() - 1);
        }
        Some(block.freeze())
    }
}

/// Classify one reassembled block. Comment-only/empty blocks yield nothing.
fn classify_block(block: &Bytes) -> Option<SseEvent> {
    let text = std::str::from_utf8(block).ok()?;
    let data: String = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let Ok(json) = serde_json::from_str::<Value>(&data) else {
        // Unparseable payloads are still forwarded — the client may know
        // more about the dialect than we do.
        return Some(SseEvent::Chunk {
            raw: block.clone(),
            usage: None,
            content_len: 0,
        });
    };

    if let Some(error) = json.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_u64)
            .or_else(|| error.get("status").and_then(Value::as_u64))
            .map(|c| c as u16);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream stream error")
            .to_string();
        let retry_after = error
            .get("retry_after")
            .and_then(Value::as_u64)
            .or_else(|| crate::blacklist::extract_retry_after(&message.to_lowercase()));
        return Some(SseEvent::UpstreamError {
            code,
            message,
            retry_after,
        });
    }

    Some(SseEvent::Chunk {
        raw: block.clone(),
        usage: parse_usage(&json),
        content_len: frame_content_len(&json),
    })
}

fn parse_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    if usage.is_null() {
        return None;
    }
    // OpenAI names with Anthropic fallbacks.
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64)?;
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

fn frame_content_len(json: &Value) -> usize {
    json.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/delta/content").and_then(Value::as_str))
                .map(str::len)
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_frame(content: &str) -> String {
        format!(
            "data: {{\"id\":\"x\",\"object\":\"chat.completion.chunk\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        )
    }

    #[test]
    fn reassembles_frames_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        let frame = chunk_frame("hello");
        let (a, b) = frame.split_at(frame.len() / 2);

        assert!(parser.push(a.as_bytes()).is_empty(), "half a frame is not a frame");
        let events = parser.push(b.as_bytes());
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Chunk { content_len, .. } => assert_eq!(*content_len, 5),
            other => panic!("expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn multiple_frames_in_one_push() {
        let mut parser = SseParser::new();
        let bytes = format!("{}{}data: [DONE]\n\n", chunk_frame("a"), chunk_frame("b"));
        let events = parser.push(bytes.as_bytes());
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], SseEvent::Done));
    }

    #[test]
    fn crlf_frames_are_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SseEvent::Done));
    }

    #[test]
    fn usage_is_extracted_from_the_final_chunk() {
        let mut parser = SseParser::new();
        let frame = "data: {\"choices\":[{\"delta\":{}}],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":34,\"total_tokens\":46}}\n\n";
        let events = parser.push(frame.as_bytes());
        match &events[0] {
            SseEvent::Chunk { usage: Some(u), .. } => {
                assert_eq!(u.prompt_tokens, 12);
                assert_eq!(u.completion_tokens, 34);
                assert_eq!(u.total_tokens, 46);
            }
            other => panic!("expected usage chunk, got {other:?}"),
        }
    }

    #[test]
    fn anthropic_style_usage_names_are_accepted() {
        let mut parser = SseParser::new();
        let frame = "data: {\"usage\":{\"input_tokens\":5,\"output_tokens\":7}}\n\n";
        let events = parser.push(frame.as_bytes());
        match &events[0] {
            SseEvent::Chunk { usage: Some(u), .. } => {
                assert_eq!(u.total_tokens, 12);
            }
            other => panic!("expected usage chunk, got {other:?}"),
        }
    }

    #[test]
    fn mid_stream_error_events_are_classified() {
        let mut parser = SseParser::new();
        let frame = "data: {\"error\":{\"code\":429,\"message\":\"rate limited, retry after 7 seconds\"}}\n\n";
        let events = parser.push(frame.as_bytes());
        match &events[0] {
            SseEvent::UpstreamError {
                code,
                message,
                retry_after,
            } => {
                assert_eq!(*code, Some(429));
                assert!(message.contains("rate limited"));
                assert_eq!(*retry_after, Some(7));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn comment_and_empty_blocks_are_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keepalive\n\n").is_empty());
        assert!(parser.push(b"\n\n").is_empty());
    }

    #[test]
    fn unparseable_data_is_still_forwarded() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: not json at all\n\n");
        assert!(matches!(events[0], SseEvent::Chunk { .. }));
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: [DONE]").is_empty());
        let events = parser.finish();
        assert!(matches!(events[0], SseEvent::Done));
        assert!(parser.finish().is_empty(), "finish drains the buffer");
    }
}
