//! OpenAI Chat Completions wire format (plus the Responses-API request shape,
//! which the gateway folds into the chat shape before routing).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatRequestMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    /// DeepSeek-style reasoning switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<JsonValue>,
    /// Kimi-style reasoning switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatRequestMessage {
    System {
        content: TextOrParts,
    },
    User {
        content: TextOrParts,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<TextOrParts>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    Tool {
        content: TextOrParts,
        tool_call_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrParts {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl TextOrParts {
    /// Flatten to plain text, the lowest common denominator OpenAI-family
    /// providers accept everywhere.
    pub fn flatten(&self) -> String {
        match self {
            TextOrParts::Text(text) => text.clone(),
            TextOrParts::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } => None,
                    })
                    .collect();
                texts.join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Stringified JSON, per the OpenAI wire contract.
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: AssistantMessage,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    FunctionCall,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

/// One `data:` chunk of a streaming chat completion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning stream, `reasoning` or `reasoning_content` depending on the
    /// provider.
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

impl ChunkDelta {
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning
            .as_deref()
            .or(self.reasoning_content.as_deref())
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Responses-API request, accepted on `/openai/v1/responses` and folded into
/// the chat shape before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub input: Option<ResponsesInput>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<ResponsesInputItem>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesInputItem {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<JsonValue>,
}

impl ResponsesRequest {
    /// Reduce to the chat shape. Item content arrays keep their text parts.
    pub fn into_chat(self) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(instructions) = self.instructions.filter(|text| !text.is_empty()) {
            messages.push(ChatRequestMessage::System {
                content: TextOrParts::Text(instructions),
            });
        }
        match self.input {
            Some(ResponsesInput::Text(text)) => messages.push(ChatRequestMessage::User {
                content: TextOrParts::Text(text),
            }),
            Some(ResponsesInput::Items(items)) => {
                for item in items {
                    let text = item.content.map(flatten_item_content).unwrap_or_default();
                    if text.is_empty() {
                        continue;
                    }
                    let message = match item.role.as_deref() {
                        Some("assistant") => ChatRequestMessage::Assistant {
                            content: Some(TextOrParts::Text(text)),
                            tool_calls: None,
                        },
                        Some("system") | Some("developer") => ChatRequestMessage::System {
                            content: TextOrParts::Text(text),
                        },
                        _ => ChatRequestMessage::User {
                            content: TextOrParts::Text(text),
                        },
                    };
                    messages.push(message);
                }
            }
            None => {}
        }

        ChatRequest {
            model: self.model,
            messages,
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
            stream: self.stream,
            ..ChatRequest::default()
        }
    }
}

fn flatten_item_content(content: JsonValue) -> String {
    match content {
        JsonValue::String(text) => text,
        JsonValue::Array(parts) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| {
                    part.get("text")
                        .and_then(JsonValue::as_str)
                        .map(|text| text.to_string())
                })
                .collect();
            texts.join("\n")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_reasoning_prefers_either_field() {
        let delta: ChunkDelta =
            serde_json::from_str(r#"{"reasoning_content":"thinking..."}"#).unwrap();
        assert_eq!(delta.reasoning_text(), Some("thinking..."));

        let delta: ChunkDelta = serde_json::from_str(r#"{"reasoning":""}"#).unwrap();
        assert_eq!(delta.reasoning_text(), None);
    }

    #[test]
    fn responses_request_folds_into_chat() {
        let req: ResponsesRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-test",
            "instructions": "be brief",
            "input": [
                {"role": "user", "content": [{"type": "input_text", "text": "hello"}]},
            ],
            "max_output_tokens": 128,
        }))
        .unwrap();
        let chat = req.into_chat();
        assert_eq!(chat.model.as_deref(), Some("gpt-test"));
        assert_eq!(chat.max_tokens, Some(128));
        assert_eq!(chat.messages.len(), 2);
        assert!(matches!(chat.messages[0], ChatRequestMessage::System { .. }));
        match &chat.messages[1] {
            ChatRequestMessage::User { content } => assert_eq!(content.flatten(), "hello"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn tool_call_arguments_stay_stringified() {
        let call: ToolCall = serde_json::from_value(serde_json::json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "f", "arguments": "{\"a\":1}"},
        }))
        .unwrap();
        assert_eq!(call.function.arguments, "{\"a\":1}");
    }
}
