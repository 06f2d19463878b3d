//! Anthropic-native upstream sniffer. The byte stream is relayed to the
//! client untouched; this observer rides along to harvest usage numbers,
//! first-token timing, and output text for fallback estimation.

use bytes::Bytes;
use ccgw_protocol::anthropic::Usage;
use ccgw_protocol::sse::SseParser;
use serde_json::Value as JsonValue;

#[derive(Debug, Default)]
pub struct AnthropicSniffer {
    parser: SseParser,
    usage: Usage,
    output_text: String,
    first_token_seen: bool,
    message_stopped: bool,
}

impl AnthropicSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, chunk: &Bytes) {
        let events = self.parser.feed(chunk);
        for event in events {
            self.inspect(&event.data);
        }
    }

    pub fn finish(&mut self) {
        let events = self.parser.finish();
        for event in events {
            self.inspect(&event.data);
        }
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn first_token_seen(&self) -> bool {
        self.first_token_seen
    }

    pub fn message_stopped(&self) -> bool {
        self.message_stopped
    }

    fn inspect(&mut self, data: &str) {
        // Tolerant parsing: the upstream dialect may carry fields newer than
        // this gateway, so sniffing works on raw JSON.
        let Ok(value) = serde_json::from_str::<JsonValue>(data) else {
            return;
        };
        match value.get("type").and_then(JsonValue::as_str) {
            Some("message_start") => {
                if let Some(usage) = value.pointer("/message/usage") {
                    self.merge_usage(usage);
                }
            }
            Some("message_delta") => {
                if let Some(usage) = value.get("usage") {
                    self.merge_usage(usage);
                }
            }
            Some("content_block_delta") => {
                self.first_token_seen = true;
                if let Some(text) = value
                    .pointer("/delta/text")
                    .or_else(|| value.pointer("/delta/thinking"))
                    .or_else(|| value.pointer("/delta/partial_json"))
                    .and_then(JsonValue::as_str)
                {
                    self.output_text.push_str(text);
                }
            }
            Some("content_block_start") => {
                self.first_token_seen = true;
            }
            Some("message_stop") => {
                self.message_stopped = true;
            }
            _ => {}
        }
    }

    fn merge_usage(&mut self, usage: &JsonValue) {
        let read = |key: &str| usage.get(key).and_then(JsonValue::as_u64);
        if let Some(input) = read("input_tokens") {
            self.usage.input_tokens = Some(input);
        }
        if let Some(output) = read("output_tokens") {
            self.usage.output_tokens = Some(output);
        }
        if let Some(cached) = read("cache_read_input_tokens") {
            self.usage.cache_read_input_tokens = Some(cached);
        }
        if let Some(created) = read("cache_creation_input_tokens") {
            self.usage.cache_creation_input_tokens = Some(created);
        }
    }
}

/// OpenAI-family passthrough sniffer: same job as [`AnthropicSniffer`] for
/// verbatim-relayed chat-completions streams.
#[derive(Debug, Default)]
pub struct OpenAiSniffer {
    parser: SseParser,
    usage: Option<ccgw_protocol::openai::ChatUsage>,
    output_text: String,
    first_token_seen: bool,
    done: bool,
}

impl OpenAiSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, chunk: &Bytes) {
        let events = self.parser.feed(chunk);
        for event in events {
            self.inspect(&event.data);
        }
    }

    pub fn finish(&mut self) {
        let events = self.parser.finish();
        for event in events {
            self.inspect(&event.data);
        }
    }

    pub fn usage(&self) -> Option<&ccgw_protocol::openai::ChatUsage> {
        self.usage.as_ref()
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn first_token_seen(&self) -> bool {
        self.first_token_seen
    }

    pub fn done(&self) -> bool {
        self.done
    }

    fn inspect(&mut self, data: &str) {
        if data.trim() == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<ccgw_protocol::openai::ChatChunk>(data) else {
            return;
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                self.first_token_seen = true;
                self.output_text.push_str(text);
            }
            if let Some(reasoning) = choice.delta.reasoning_text() {
                self.first_token_seen = true;
                self.output_text.push_str(reasoning);
            }
            for call in choice.delta.tool_calls.as_deref().unwrap_or_default() {
                if let Some(arguments) = call
                    .function
                    .as_ref()
                    .and_then(|function| function.arguments.as_deref())
                {
                    self.first_token_seen = true;
                    self.output_text.push_str(arguments);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: serde_json::Value) -> Bytes {
        Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
    }

    #[test]
    fn harvests_usage_across_start_and_delta() {
        let mut sniffer = AnthropicSniffer::new();
        sniffer.observe(&frame(
            "message_start",
            serde_json::json!({"type": "message_start", "message": {
                "usage": {"input_tokens": 120, "cache_read_input_tokens": 30}}}),
        ));
        sniffer.observe(&frame(
            "content_block_delta",
            serde_json::json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "Hello"}}),
        ));
        sniffer.observe(&frame(
            "message_delta",
            serde_json::json!({"type": "message_delta",
                "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 17}}),
        ));
        sniffer.observe(&frame(
            "message_stop",
            serde_json::json!({"type": "message_stop"}),
        ));

        assert_eq!(sniffer.usage().input_tokens, Some(120));
        assert_eq!(sniffer.usage().output_tokens, Some(17));
        assert_eq!(sniffer.usage().cache_read_input_tokens, Some(30));
        assert_eq!(sniffer.output_text(), "Hello");
        assert!(sniffer.first_token_seen());
        assert!(sniffer.message_stopped());
    }

    #[test]
    fn first_token_stays_unset_until_content() {
        let mut sniffer = AnthropicSniffer::new();
        sniffer.observe(&frame(
            "message_start",
            serde_json::json!({"type": "message_start", "message": {"usage": {}}}),
        ));
        sniffer.observe(&Bytes::from_static(b"event: ping\ndata: {\"type\": \"ping\"}\n\n"));
        assert!(!sniffer.first_token_seen());
    }

    #[test]
    fn openai_sniffer_collects_usage_and_done() {
        let mut sniffer = OpenAiSniffer::new();
        sniffer.observe(&Bytes::from(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n".to_string(),
        ));
        sniffer.observe(&Bytes::from(
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n"
                .to_string(),
        ));
        sniffer.observe(&Bytes::from_static(b"data: [DONE]\n\n"));
        assert!(sniffer.first_token_seen());
        assert!(sniffer.done());
        assert_eq!(sniffer.output_text(), "Hi");
        assert_eq!(sniffer.usage().unwrap().prompt_tokens, Some(5));
    }

    #[test]
    fn split_frames_and_garbage_are_tolerated() {
        let mut sniffer = AnthropicSniffer::new();
        sniffer.observe(&Bytes::from_static(b"data: {\"type\": \"content_bl"));
        sniffer.observe(&Bytes::from_static(
            b"ock_delta\", \"delta\": {\"text\": \"ab\"}}\n\n",
        ));
        sniffer.observe(&Bytes::from_static(b"data: not-json\n\n"));
        sniffer.finish();
        assert_eq!(sniffer.output_text(), "ab");
    }
}
