//! Canonical payload → OpenAI chat request, and OpenAI JSON response →
//! Anthropic response.

use ccgw_config::ProviderType;
use ccgw_protocol::anthropic::{MessagesResponse, ResponseBlock, StopReason, Usage};
use ccgw_protocol::internal::{ChatMessage, ChatPayload, ChatRole, ContentBlock, ToolChoice};
use ccgw_protocol::openai::{
    ChatRequest, ChatRequestMessage, ChatResponse, FinishReason, FunctionCall,
    FunctionDefinition, TextOrParts, ToolCall, ToolDefinition,
};
use serde_json::Value as JsonValue;

/// Build an OpenAI chat-completions body. `provider` selects the reasoning
/// hint dialect for thinking-enabled requests.
pub fn request_from_internal(
    payload: &ChatPayload,
    model: &str,
    provider: ProviderType,
) -> ChatRequest {
    let mut messages = Vec::new();
    if !payload.system.is_empty() {
        messages.push(ChatRequestMessage::System {
            content: TextOrParts::Text(payload.system.clone()),
        });
    }
    for message in &payload.messages {
        messages.extend(map_message(message));
    }

    let tools: Vec<ToolDefinition> = payload.tools.iter().map(map_tool).collect();
    let (reasoning, thinking) = reasoning_hints(payload, provider);

    ChatRequest {
        model: Some(model.to_string()),
        messages,
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: payload.tool_choice.as_ref().map(map_tool_choice),
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
        max_completion_tokens: None,
        stream: payload.stream.then_some(true),
        stream_options: None,
        reasoning,
        thinking,
        user: payload.session_id.clone(),
    }
}

fn reasoning_hints(
    payload: &ChatPayload,
    provider: ProviderType,
) -> (Option<JsonValue>, Option<JsonValue>) {
    if !payload.thinking_enabled() {
        return (None, None);
    }
    match provider {
        ProviderType::Deepseek => (Some(serde_json::json!({"enabled": true})), None),
        ProviderType::Kimi => (None, Some(serde_json::json!({"type": "enabled"}))),
        // No known dialect; omit rather than guess.
        _ => (None, None),
    }
}

fn map_message(message: &ChatMessage) -> Vec<ChatRequestMessage> {
    match message.role {
        ChatRole::User => map_user_message(&message.content),
        ChatRole::Assistant => map_assistant_message(&message.content),
    }
}

/// Tool results split into their own `role:"tool"` messages; everything else
/// flattens to user text per OpenAI rules.
fn map_user_message(blocks: &[ContentBlock]) -> Vec<ChatRequestMessage> {
    let mut output = Vec::new();
    let mut texts: Vec<String> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::ToolResult { id, content } => {
                flush_user_text(&mut output, &mut texts);
                output.push(ChatRequestMessage::Tool {
                    content: TextOrParts::Text(content.clone()),
                    tool_call_id: id.clone(),
                });
            }
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    texts.push(text.clone());
                }
            }
            ContentBlock::Image { source } => {
                if let Some(url) = image_url(source) {
                    texts.push(format!("[image: {url}]"));
                }
            }
            ContentBlock::ToolUse { .. } => {
                // A tool_use in a user turn is malformed input; drop it.
            }
        }
    }

    flush_user_text(&mut output, &mut texts);
    output
}

fn flush_user_text(output: &mut Vec<ChatRequestMessage>, texts: &mut Vec<String>) {
    if texts.is_empty() {
        return;
    }
    output.push(ChatRequestMessage::User {
        content: TextOrParts::Text(texts.join("\n")),
    });
    texts.clear();
}

fn map_assistant_message(blocks: &[ContentBlock]) -> Vec<ChatRequestMessage> {
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    texts.push(text.clone());
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    vec![ChatRequestMessage::Assistant {
        content: if texts.is_empty() {
            None
        } else {
            Some(TextOrParts::Text(texts.join("\n")))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    }]
}

fn image_url(source: &JsonValue) -> Option<String> {
    if let Some(url) = source.get("url").and_then(JsonValue::as_str) {
        return Some(url.to_string());
    }
    let media_type = source.get("media_type").and_then(JsonValue::as_str)?;
    source
        .get("data")
        .and_then(JsonValue::as_str)
        .map(|data| format!("data:{media_type};base64,{data}"))
}

fn map_tool(tool: &ccgw_protocol::internal::ToolDefinition) -> ToolDefinition {
    ToolDefinition {
        r#type: "function".to_string(),
        function: FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn map_tool_choice(choice: &ToolChoice) -> JsonValue {
    match choice {
        ToolChoice::Auto => JsonValue::String("auto".to_string()),
        ToolChoice::Any => JsonValue::String("required".to_string()),
        ToolChoice::None => JsonValue::String("none".to_string()),
        ToolChoice::Tool { name } => {
            serde_json::json!({"type": "function", "function": {"name": name}})
        }
    }
}

/// Normalize an inbound OpenAI chat request. System messages fold into the
/// canonical system prompt; assistant `tool_calls` and `role:"tool"` messages
/// become tagged blocks.
pub fn to_internal(request: &ChatRequest) -> ChatPayload {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ChatMessage> = Vec::new();

    for message in &request.messages {
        match message {
            ChatRequestMessage::System { content } => {
                let text = content.flatten();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            ChatRequestMessage::User { content } => {
                let text = content.flatten();
                messages.push(ChatMessage {
                    role: ChatRole::User,
                    content: vec![ContentBlock::Text { text }],
                });
            }
            ChatRequestMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut blocks = Vec::new();
                if let Some(text) = content.as_ref().map(TextOrParts::flatten)
                    && !text.is_empty()
                {
                    blocks.push(ContentBlock::Text { text });
                }
                for call in tool_calls.as_deref().unwrap_or_default() {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(JsonValue::Object(Default::default())),
                    });
                }
                messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: blocks,
                });
            }
            ChatRequestMessage::Tool {
                content,
                tool_call_id,
            } => {
                messages.push(ChatMessage {
                    role: ChatRole::User,
                    content: vec![ContentBlock::ToolResult {
                        id: tool_call_id.clone(),
                        content: content.flatten(),
                    }],
                });
            }
        }
    }

    ChatPayload {
        system: system_parts.join("\n"),
        messages,
        tools: request
            .tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|tool| ccgw_protocol::internal::ToolDefinition {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool.function.parameters.clone(),
            })
            .collect(),
        tool_choice: request.tool_choice.as_ref().and_then(unmap_tool_choice),
        stream: request.stream.unwrap_or(false),
        thinking: request.thinking.clone().or_else(|| request.reasoning.clone()),
        temperature: request.temperature,
        max_tokens: request.max_tokens.or(request.max_completion_tokens),
        session_id: request.user.clone(),
    }
}

fn unmap_tool_choice(choice: &JsonValue) -> Option<ToolChoice> {
    match choice {
        JsonValue::String(mode) => match mode.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Any),
            "none" => Some(ToolChoice::None),
            _ => None,
        },
        JsonValue::Object(_) => choice
            .pointer("/function/name")
            .and_then(JsonValue::as_str)
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

/// Translate a non-streaming OpenAI response into the Anthropic shape.
pub fn response_to_anthropic(response: &ChatResponse, fallback_model: &str) -> MessagesResponse {
    let mut content = Vec::new();
    let mut saw_tool_call = false;
    let mut finish = None;

    if let Some(choice) = response.choices.first() {
        finish = choice.finish_reason;
        if let Some(reasoning) = choice
            .message
            .reasoning_content
            .as_deref()
            .filter(|text| !text.is_empty())
        {
            content.push(ResponseBlock::Thinking {
                thinking: reasoning.to_string(),
            });
        }
        if let Some(text) = choice
            .message
            .content
            .as_deref()
            .filter(|text| !text.is_empty())
        {
            content.push(ResponseBlock::Text {
                text: text.to_string(),
            });
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            saw_tool_call = true;
            content.push(ResponseBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(JsonValue::Object(Default::default())),
            });
        }
    }

    let stop_reason = match finish {
        Some(reason) => Some(map_finish_reason(reason)),
        None if saw_tool_call => Some(StopReason::ToolUse),
        None => Some(StopReason::EndTurn),
    };

    MessagesResponse {
        id: synth_message_id(&response.id),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: if response.model.is_empty() {
            fallback_model.to_string()
        } else {
            response.model.clone()
        },
        content,
        stop_reason,
        stop_sequence: None,
        usage: map_usage(response.usage.as_ref()),
    }
}

pub fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}

pub fn map_usage(usage: Option<&ccgw_protocol::openai::ChatUsage>) -> Usage {
    match usage {
        Some(usage) => Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .and_then(|details| details.cached_tokens),
            cache_creation_input_tokens: None,
        },
        None => Usage::default(),
    }
}

pub fn synth_message_id(upstream_id: &str) -> String {
    if upstream_id.is_empty() {
        "msg_unknown".to_string()
    } else if let Some(rest) = upstream_id.strip_prefix("chatcmpl-") {
        format!("msg_{rest}")
    } else {
        format!("msg_{upstream_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccgw_protocol::internal::ToolDefinition as InternalTool;

    fn payload_with_tools() -> ChatPayload {
        ChatPayload {
            system: "be brief".to_string(),
            messages: vec![
                ChatMessage {
                    role: ChatRole::User,
                    content: vec![ContentBlock::Text {
                        text: "weather in Berlin?".to_string(),
                    }],
                },
                ChatMessage {
                    role: ChatRole::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: "toolu_1".to_string(),
                        name: "get_weather".to_string(),
                        input: serde_json::json!({"city": "Berlin"}),
                    }],
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: vec![ContentBlock::ToolResult {
                        id: "toolu_1".to_string(),
                        content: "sunny".to_string(),
                    }],
                },
            ],
            tools: vec![InternalTool {
                name: "get_weather".to_string(),
                description: None,
                input_schema: Some(serde_json::json!({"type": "object"})),
            }],
            ..ChatPayload::default()
        }
    }

    #[test]
    fn tool_use_becomes_tool_calls_with_stringified_arguments() {
        let request = request_from_internal(&payload_with_tools(), "gpt-test", ProviderType::Openai);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][2]["role"], "assistant");
        let arguments = json["messages"][2]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<JsonValue>(arguments).unwrap(),
            serde_json::json!({"city": "Berlin"})
        );
        assert_eq!(json["messages"][3]["role"], "tool");
        assert_eq!(json["messages"][3]["tool_call_id"], "toolu_1");
    }

    #[test]
    fn reasoning_hint_dialects() {
        let mut payload = payload_with_tools();
        payload.thinking = Some(serde_json::json!({"type": "enabled"}));

        let deepseek = request_from_internal(&payload, "m", ProviderType::Deepseek);
        assert!(deepseek.reasoning.is_some());
        assert!(deepseek.thinking.is_none());

        let kimi = request_from_internal(&payload, "m", ProviderType::Kimi);
        assert!(kimi.reasoning.is_none());
        assert!(kimi.thinking.is_some());

        let plain = request_from_internal(&payload, "m", ProviderType::Openai);
        assert!(plain.reasoning.is_none() && plain.thinking.is_none());
    }

    #[test]
    fn response_translation_maps_blocks_and_stop_reason() {
        let response: ChatResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-abc",
            "model": "gpt-test",
            "choices": [{
                "index": 0,
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": "checking",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Berlin\"}"},
                    }],
                },
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 5,
                      "prompt_tokens_details": {"cached_tokens": 3}},
        }))
        .unwrap();

        let message = response_to_anthropic(&response, "fallback");
        assert_eq!(message.id, "msg_abc");
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.input_tokens, Some(11));
        assert_eq!(message.usage.cache_read_input_tokens, Some(3));
        assert_eq!(message.content.len(), 2);
        match &message.content[1] {
            ResponseBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Berlin");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn inbound_openai_request_normalizes() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "stream": true,
            "max_completion_tokens": 256,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "f", "arguments": "{\"a\":1}"},
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "ok"},
            ],
        }))
        .unwrap();
        let payload = to_internal(&request);
        assert_eq!(payload.system, "be brief");
        assert!(payload.stream);
        assert_eq!(payload.max_tokens, Some(256));
        assert_eq!(payload.messages.len(), 3);
        match &payload.messages[1].content[0] {
            ContentBlock::ToolUse { id, input, .. } => {
                assert_eq!(id, "call_1");
                assert_eq!(input["a"], 1);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &payload.messages[2].content[0] {
            ContentBlock::ToolResult { id, content } => {
                assert_eq!(id, "call_1");
                assert_eq!(content, "ok");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason(FinishReason::Stop), StopReason::EndTurn);
        assert_eq!(map_finish_reason(FinishReason::Length), StopReason::MaxTokens);
        assert_eq!(map_finish_reason(FinishReason::ToolCalls), StopReason::ToolUse);
        assert_eq!(
            map_finish_reason(FinishReason::ContentFilter),
            StopReason::Refusal
        );
    }
}
