use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Canonical chat payload every wire format normalizes into.
///
/// Adapters translate between this form and the Anthropic / OpenAI wire
/// shapes; the router and the request pipeline only ever see this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    /// The caller's `thinking` configuration, preserved verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// `metadata.user_id` from Anthropic callers; used as the log session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatPayload {
    /// Whether the caller asked for extended reasoning. Accepts both the
    /// Anthropic object form (`{"type":"enabled",...}`) and a bare boolean.
    pub fn thinking_enabled(&self) -> bool {
        match &self.thinking {
            Some(JsonValue::Bool(flag)) => *flag,
            Some(JsonValue::Object(map)) => {
                map.get("type").and_then(JsonValue::as_str) == Some("enabled")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Tagged content block. Adapters switch on the tag; nothing downstream
/// inspects dynamic JSON shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: JsonValue,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_enabled_accepts_object_and_bool() {
        let mut payload = ChatPayload::default();
        assert!(!payload.thinking_enabled());

        payload.thinking = Some(serde_json::json!({"type": "enabled", "budget_tokens": 1024}));
        assert!(payload.thinking_enabled());

        payload.thinking = Some(serde_json::json!({"type": "disabled"}));
        assert!(!payload.thinking_enabled());

        payload.thinking = Some(JsonValue::Bool(true));
        assert!(payload.thinking_enabled());
    }

    #[test]
    fn content_block_tags_round_trip() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "get_weather".to_string(),
            input: serde_json::json!({"city": "Berlin"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }
}
