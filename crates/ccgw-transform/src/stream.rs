//! OpenAI streaming chunks → Anthropic stream events.
//!
//! One state machine per request. Event order invariant: `message_start`
//! first, every `content_block_delta(i)` inside an open block `i`, all blocks
//! closed before `message_delta`, `message_stop` last.

use std::collections::BTreeMap;

use ccgw_protocol::anthropic::{
    BlockDelta, MessageDeltaBody, MessagesResponse, ResponseBlock, StopReason, StreamEvent, Usage,
};
use ccgw_protocol::openai::{ChatChunk, ChatUsage, FinishReason, ToolCallDelta};

use crate::openai::{map_finish_reason, map_usage, synth_message_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Streaming,
    Closed,
}

#[derive(Debug)]
pub struct OpenAiToAnthropicStream {
    client_model: String,
    phase: Phase,
    message_id: String,
    model: String,
    next_index: u32,
    text_block: Option<u32>,
    /// Upstream `tool_calls[].index` → our block index.
    tool_blocks: BTreeMap<i64, u32>,
    tool_call_seen: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<ChatUsage>,
    output_text: String,
    first_token_seen: bool,
}

impl OpenAiToAnthropicStream {
    pub fn new(client_model: &str) -> Self {
        Self {
            client_model: client_model.to_string(),
            phase: Phase::NotStarted,
            message_id: "msg_unknown".to_string(),
            model: client_model.to_string(),
            next_index: 0,
            text_block: None,
            tool_blocks: BTreeMap::new(),
            tool_call_seen: false,
            finish_reason: None,
            usage: None,
            output_text: String::new(),
            first_token_seen: false,
        }
    }

    /// Latest usage observed from the upstream, if any chunk carried one.
    pub fn usage(&self) -> Option<&ChatUsage> {
        self.usage.as_ref()
    }

    /// Accumulated output text, for token estimation when usage is absent.
    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn first_token_seen(&self) -> bool {
        self.first_token_seen
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn on_chunk(&mut self, chunk: &ChatChunk) -> Vec<StreamEvent> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.ensure_started(chunk, &mut events);

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                let index = self.open_text_block(&mut events);
                self.push_first_token();
                self.output_text.push_str(text);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta {
                        text: text.to_string(),
                    },
                });
            }

            if let Some(reasoning) = choice.delta.reasoning_text() {
                let index = self.open_text_block(&mut events);
                self.push_first_token();
                self.output_text.push_str(reasoning);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: reasoning.to_string(),
                    },
                });
            }

            for call in choice.delta.tool_calls.as_deref().unwrap_or_default() {
                self.on_tool_call(call, &mut events);
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        events
    }

    /// Terminal events, emitted once: close open blocks in ascending index
    /// order, then `message_delta` with the final usage and `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.phase == Phase::NotStarted {
            events.push(self.start_event());
        }
        self.phase = Phase::Closed;

        let mut open: Vec<u32> = self.text_block.take().into_iter().collect();
        open.extend(std::mem::take(&mut self.tool_blocks).into_values());
        open.sort_unstable();
        for index in open {
            events.push(StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = match self.finish_reason {
            Some(reason) => map_finish_reason(reason),
            None if self.tool_call_seen => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: map_usage(self.usage.as_ref()),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn ensure_started(&mut self, chunk: &ChatChunk, events: &mut Vec<StreamEvent>) {
        if self.phase != Phase::NotStarted {
            return;
        }
        if !chunk.id.is_empty() {
            self.message_id = synth_message_id(&chunk.id);
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        self.phase = Phase::Streaming;
        events.push(self.start_event());
    }

    fn start_event(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.message_id.clone(),
                r#type: "message".to_string(),
                role: "assistant".to_string(),
                model: if self.model.is_empty() {
                    self.client_model.clone()
                } else {
                    self.model.clone()
                },
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    fn open_text_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        match self.text_block {
            Some(index) => index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.text_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        }
    }

    fn on_tool_call(&mut self, call: &ToolCallDelta, events: &mut Vec<StreamEvent>) {
        self.tool_call_seen = true;
        let index = match self.tool_blocks.get(&call.index) {
            Some(index) => *index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.tool_blocks.insert(call.index, index);
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolcall_{}", call.index));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::Value::Object(Default::default()),
                    },
                });
                index
            }
        };

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_deref())
            .filter(|arguments| !arguments.is_empty())
        {
            self.push_first_token();
            self.output_text.push_str(arguments);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    fn push_first_token(&mut self) {
        self.first_token_seen = true;
    }
}
