//! Character/word token estimator, used when an upstream omits usage numbers
//! and by the router's long-context check. Deliberately cheap: the gateway
//! never needs exact counts, only a stable order of magnitude.

use crate::internal::{ChatPayload, ContentBlock};

/// Estimate tokens for a text fragment. ASCII text averages about four
/// characters per token; CJK and other wide scripts sit near one token per
/// character, so non-ASCII characters are counted individually.
pub fn estimate_text(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let mut ascii = 0u64;
    let mut wide = 0u64;
    for ch in text.chars() {
        if ch.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }
    let words = text.split_whitespace().count() as u64;
    // Whichever of the char-based and word-based views is larger tends to be
    // closer to real tokenizer output on mixed content.
    (ascii.div_ceil(4)).max(words) + wide
}

/// Estimate the input-token footprint of a full payload: system prompt,
/// message content, and tool schemas.
pub fn estimate_payload(payload: &ChatPayload) -> u64 {
    let mut total = estimate_text(&payload.system);

    for message in &payload.messages {
        for block in &message.content {
            total += match block {
                ContentBlock::Text { text } => estimate_text(text),
                ContentBlock::ToolResult { content, .. } => estimate_text(content),
                ContentBlock::ToolUse { name, input, .. } => {
                    estimate_text(name) + estimate_json(input)
                }
                // A fixed charge per image; the gateway has no vision
                // tokenizer and images never dominate routing decisions.
                ContentBlock::Image { .. } => 1_000,
            };
        }
        // Per-message envelope overhead.
        total += 4;
    }

    for tool in &payload.tools {
        total += estimate_text(&tool.name);
        if let Some(description) = &tool.description {
            total += estimate_text(description);
        }
        if let Some(schema) = &tool.input_schema {
            total += estimate_json(schema);
        }
    }

    total
}

fn estimate_json(value: &serde_json::Value) -> u64 {
    match serde_json::to_string(value) {
        Ok(text) => estimate_text(&text),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::{ChatMessage, ChatRole};

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_text(""), 0);
    }

    #[test]
    fn ascii_text_scales_with_length() {
        let short = estimate_text("hello world");
        let long = estimate_text(&"hello world ".repeat(100));
        assert!(long > short * 50);
    }

    #[test]
    fn wide_chars_count_individually() {
        assert!(estimate_text("日本語のテキスト") >= 8);
    }

    #[test]
    fn payload_estimate_covers_messages_and_tools() {
        let payload = ChatPayload {
            system: "you are a helpful assistant".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: vec![ContentBlock::Text {
                    text: "summarize this".to_string(),
                }],
            }],
            tools: vec![crate::internal::ToolDefinition {
                name: "search".to_string(),
                description: Some("full text search".to_string()),
                input_schema: Some(serde_json::json!({"type": "object"})),
            }],
            ..ChatPayload::default()
        };
        let total = estimate_payload(&payload);
        assert!(total > estimate_text(&payload.system));
    }
}
