//! Anthropic wire format ⇄ canonical payload.

use ccgw_protocol::anthropic::{
    ContentBlockParam, MessageContent, MessageParam, MessageRole, MessagesRequest, Metadata,
    SystemParam, ToolChoiceParam, ToolParam, ToolResultBlock, ToolResultContent,
};
use ccgw_protocol::internal::{
    ChatMessage, ChatPayload, ChatRole, ContentBlock, ToolChoice, ToolDefinition,
};

/// Normalize an Anthropic Messages request. The requested model travels
/// separately (the router owns model resolution).
pub fn to_internal(request: &MessagesRequest) -> ChatPayload {
    let system = match &request.system {
        Some(SystemParam::Text(text)) => text.clone(),
        Some(SystemParam::Blocks(blocks)) => {
            let texts: Vec<&str> = blocks.iter().map(|block| block.text.as_str()).collect();
            texts.join("\n")
        }
        None => String::new(),
    };

    let messages = request.messages.iter().map(map_message).collect();

    ChatPayload {
        system,
        messages,
        tools: request
            .tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(map_tool)
            .collect(),
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
        stream: request.stream.unwrap_or(false),
        thinking: request.thinking.clone(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        session_id: request
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.user_id.clone()),
    }
}

/// Reassemble an upstream Anthropic request body from the canonical payload.
pub fn from_internal(payload: &ChatPayload, model: &str) -> MessagesRequest {
    MessagesRequest {
        model: Some(model.to_string()),
        max_tokens: payload.max_tokens,
        system: if payload.system.is_empty() {
            None
        } else {
            Some(SystemParam::Text(payload.system.clone()))
        },
        messages: payload.messages.iter().map(unmap_message).collect(),
        tools: if payload.tools.is_empty() {
            None
        } else {
            Some(payload.tools.iter().map(unmap_tool).collect())
        },
        tool_choice: payload.tool_choice.as_ref().map(unmap_tool_choice),
        temperature: payload.temperature,
        stream: payload.stream.then_some(true),
        thinking: payload.thinking.clone(),
        metadata: payload.session_id.as_ref().map(|user_id| Metadata {
            user_id: Some(user_id.clone()),
        }),
    }
}

fn map_message(message: &MessageParam) -> ChatMessage {
    let role = match message.role {
        MessageRole::User => ChatRole::User,
        MessageRole::Assistant => ChatRole::Assistant,
    };
    let content = match &message.content {
        MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
        MessageContent::Blocks(blocks) => blocks.iter().filter_map(map_block).collect(),
    };
    ChatMessage { role, content }
}

fn map_block(block: &ContentBlockParam) -> Option<ContentBlock> {
    match block {
        ContentBlockParam::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
        ContentBlockParam::Image { source } => Some(ContentBlock::Image {
            source: source.clone(),
        }),
        ContentBlockParam::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        }),
        ContentBlockParam::ToolResult {
            tool_use_id,
            content,
            ..
        } => Some(ContentBlock::ToolResult {
            id: tool_use_id.clone(),
            content: flatten_tool_result(content.as_ref()),
        }),
        // Echoed thinking blocks carry no information the upstream needs.
        ContentBlockParam::Thinking { .. } => None,
    }
}

fn flatten_tool_result(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => {
            let texts: Vec<String> = blocks
                .iter()
                .map(|block| match block {
                    ToolResultBlock::Text { text } => text.clone(),
                    ToolResultBlock::Image { .. } => "[image]".to_string(),
                })
                .collect();
            texts.join("\n")
        }
        None => String::new(),
    }
}

fn map_tool(tool: &ToolParam) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

fn map_tool_choice(choice: &ToolChoiceParam) -> ToolChoice {
    match choice {
        ToolChoiceParam::Auto => ToolChoice::Auto,
        ToolChoiceParam::Any => ToolChoice::Any,
        ToolChoiceParam::None => ToolChoice::None,
        ToolChoiceParam::Tool { name } => ToolChoice::Tool { name: name.clone() },
    }
}

fn unmap_message(message: &ChatMessage) -> MessageParam {
    MessageParam {
        role: match message.role {
            ChatRole::User => MessageRole::User,
            ChatRole::Assistant => MessageRole::Assistant,
        },
        content: MessageContent::Blocks(message.content.iter().map(unmap_block).collect()),
    }
}

fn unmap_block(block: &ContentBlock) -> ContentBlockParam {
    match block {
        ContentBlock::Text { text } => ContentBlockParam::Text { text: text.clone() },
        ContentBlock::Image { source } => ContentBlockParam::Image {
            source: source.clone(),
        },
        ContentBlock::ToolUse { id, name, input } => ContentBlockParam::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult { id, content } => ContentBlockParam::ToolResult {
            tool_use_id: id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: None,
        },
    }
}

fn unmap_tool(tool: &ToolDefinition) -> ToolParam {
    ToolParam {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

fn unmap_tool_choice(choice: &ToolChoice) -> ToolChoiceParam {
    match choice {
        ToolChoice::Auto => ToolChoiceParam::Auto,
        ToolChoice::Any => ToolChoiceParam::Any,
        ToolChoice::None => ToolChoiceParam::None,
        ToolChoice::Tool { name } => ToolChoiceParam::Tool { name: name.clone() },
    }
}
