//! Anthropic upstream → OpenAI-format caller: JSON response translation and
//! the streaming event → chat-chunk state machine.

use std::collections::BTreeMap;

use ccgw_protocol::anthropic::{
    BlockDelta, MessagesResponse, ResponseBlock, StopReason, StreamEvent, Usage,
};
use serde_json::{json, Value as JsonValue};

pub fn finish_reason_from_stop(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::Refusal => "content_filter",
    }
}

fn usage_json(usage: &Usage) -> JsonValue {
    let prompt = usage.input_tokens.unwrap_or(0);
    let completion = usage.output_tokens.unwrap_or(0);
    let mut value = json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    });
    if let Some(cached) = usage.cache_read_input_tokens {
        value["prompt_tokens_details"] = json!({"cached_tokens": cached});
    }
    value
}

fn chat_id(message_id: &str) -> String {
    match message_id.strip_prefix("msg_") {
        Some(rest) => format!("chatcmpl-{rest}"),
        None => format!("chatcmpl-{message_id}"),
    }
}

/// Non-streaming translation.
pub fn response_to_openai(message: &MessagesResponse, created: i64) -> JsonValue {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut reasoning_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &message.content {
        match block {
            ResponseBlock::Text { text } => text_parts.push(text),
            ResponseBlock::Thinking { thinking } => reasoning_parts.push(thinking),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    },
                }));
            }
        }
    }

    let mut assistant = json!({
        "role": "assistant",
        "content": if text_parts.is_empty() {
            JsonValue::Null
        } else {
            JsonValue::String(text_parts.join(""))
        },
    });
    if !reasoning_parts.is_empty() {
        assistant["reasoning_content"] = JsonValue::String(reasoning_parts.join(""));
    }
    if !tool_calls.is_empty() {
        assistant["tool_calls"] = JsonValue::Array(tool_calls);
    }

    let finish_reason = message
        .stop_reason
        .map(finish_reason_from_stop)
        .unwrap_or("stop");

    json!({
        "id": chat_id(&message.id),
        "object": "chat.completion",
        "created": created,
        "model": message.model,
        "choices": [{
            "index": 0,
            "message": assistant,
            "finish_reason": finish_reason,
        }],
        "usage": usage_json(&message.usage),
    })
}

/// Streaming translation. Feed parsed upstream events in arrival order; each
/// call returns zero or more chat chunks to serialize as `data:` frames.
#[derive(Debug)]
pub struct AnthropicToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    /// Anthropic block index → OpenAI tool_calls index.
    tool_indexes: BTreeMap<u32, i64>,
    next_tool_index: i64,
    stop_reason: Option<StopReason>,
    usage: Usage,
    output_text: String,
    first_token_seen: bool,
    closed: bool,
}

impl AnthropicToOpenAiStream {
    pub fn new(client_model: &str, created: i64) -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: client_model.to_string(),
            created,
            role_sent: false,
            tool_indexes: BTreeMap::new(),
            next_tool_index: 0,
            stop_reason: None,
            usage: Usage::default(),
            output_text: String::new(),
            first_token_seen: false,
            closed: false,
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

    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<JsonValue> {
        if self.closed {
            return Vec::new();
        }
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = chat_id(&message.id);
                if !message.model.is_empty() {
                    self.model = message.model.clone();
                }
                self.merge_usage(&message.usage);
                self.role_sent = true;
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseBlock::ToolUse { id, name, .. },
            } => {
                let tool_index = self.next_tool_index;
                self.next_tool_index += 1;
                self.tool_indexes.insert(*index, tool_index);
                vec![self.chunk(
                    json!({"tool_calls": [{
                        "index": tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                )]
            }
            StreamEvent::ContentBlockStart { .. } => Vec::new(),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    self.first_token_seen = true;
                    self.output_text.push_str(text);
                    vec![self.chunk(json!({"content": text}), None)]
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    self.first_token_seen = true;
                    self.output_text.push_str(thinking);
                    vec![self.chunk(json!({"reasoning_content": thinking}), None)]
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_indexes.get(index).copied() else {
                        return Vec::new();
                    };
                    self.first_token_seen = true;
                    self.output_text.push_str(partial_json);
                    vec![self.chunk(
                        json!({"tool_calls": [{
                            "index": tool_index,
                            "function": {"arguments": partial_json},
                        }]}),
                        None,
                    )]
                }
            },
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => Vec::new(),
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                self.merge_usage(usage);
                Vec::new()
            }
            StreamEvent::MessageStop => self.finish(),
            StreamEvent::Error { .. } => Vec::new(),
        }
    }

    /// Final chunk carrying the finish reason and accumulated usage. The
    /// caller appends the `[DONE]` frame.
    pub fn finish(&mut self) -> Vec<JsonValue> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let finish = self
            .stop_reason
            .map(finish_reason_from_stop)
            .unwrap_or("stop");
        let mut chunk = self.chunk(json!({}), Some(finish));
        chunk["usage"] = usage_json(&self.usage);
        vec![chunk]
    }

    fn chunk(&self, delta: JsonValue, finish: Option<&str>) -> JsonValue {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        })
    }

    fn merge_usage(&mut self, usage: &Usage) {
        if usage.input_tokens.is_some() {
            self.usage.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens.is_some() {
            self.usage.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_input_tokens.is_some() {
            self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
        }
    }
}
