//! Anthropic to OpenAI request mapper.
//!
//! Converts a Messages API request into Chat Completions format.
//! Handles:
//! - System prompt (top-level field → leading system message)
//! - Content blocks (array → string, or part array for multimodal)
//! - tool_use blocks → assistant `tool_calls` entries
//! - tool_result blocks → `tool`-role messages correlated by call id
//! - Tool definitions (`input_schema` → `parameters`) and tool_choice
//! - `stop_sequences` → `stop`; Anthropic-only fields dropped

use serde_json::Value;
use tracing::debug;

use crate::schema::anthropic::{
    ContentBlock, ImageSource, MessageContent, MessagesRequest, Role, ToolDefinition,
};
use crate::schema::openai::{
    ChatCompletionMessage, ChatContent, ChatRequest, ContentPart, FunctionCall,
    FunctionDefinition, FunctionTool, ImageUrl, ToolCall,
};

/// Map a Messages API request onto the upstream Chat Completions shape.
///
/// Pure and deterministic: same input, same output, no I/O. Every content
/// block lands in exactly one upstream fragment or message-role placement;
/// fields the upstream schema has no equivalent for (`metadata`) are dropped.
pub fn map_request(request: MessagesRequest) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(ChatCompletionMessage::text("system", text));
        }
    }

    for message in request.messages {
        match message.content {
            MessageContent::Text(text) => {
                messages.push(ChatCompletionMessage::text(role_name(message.role), text));
            }
            MessageContent::Blocks(blocks) => match message.role {
                Role::User => push_user_blocks(&mut messages, blocks),
                Role::Assistant => push_assistant_blocks(&mut messages, blocks),
            },
        }
    }

    ChatRequest {
        model: request.model,
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        tools: request
            .tools
            .map(|tools| tools.into_iter().map(map_tool).collect()),
        tool_choice: request.tool_choice.and_then(map_tool_choice),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Flatten a user message's blocks. tool_result blocks become standalone
/// `tool`-role messages (emitted in block order, so they precede any text
/// the same Anthropic message carries, matching the upstream convention);
/// the remaining text/image blocks become one user message.
fn push_user_blocks(messages: &mut Vec<ChatCompletionMessage>, blocks: Vec<ContentBlock>) {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut has_image = false;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
            ContentBlock::Image { source } => {
                has_image = true;
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url(&source),
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error: _,
            } => {
                messages.push(ChatCompletionMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(flatten_block_text(&content))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
            ContentBlock::ToolUse { name, .. } => {
                // tool_use only makes sense on assistant turns
                debug!(tool = %name, "dropping tool_use block in user message");
            }
        }
    }

    if parts.is_empty() {
        return;
    }

    let content = if has_image {
        ChatContent::Parts(parts)
    } else {
        // Text-only runs flatten to the plain-string form
        let texts: Vec<String> = parts
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect();
        ChatContent::Text(texts.join("\n\n"))
    };

    messages.push(ChatCompletionMessage {
        role: "user".to_string(),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
}

/// Flatten an assistant message's blocks into one upstream assistant entry:
/// text joins into the content string, tool_use blocks become `tool_calls`.
fn push_assistant_blocks(messages: &mut Vec<ChatCompletionMessage>, blocks: Vec<ContentBlock>) {
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                let arguments =
                    serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: FunctionCall { name, arguments },
                });
            }
            ContentBlock::Image { .. } => {
                debug!("dropping image block in assistant message");
            }
            ContentBlock::ToolResult { tool_use_id, .. } => {
                debug!(id = %tool_use_id, "dropping tool_result block in assistant message");
            }
        }
    }

    if texts.is_empty() && tool_calls.is_empty() {
        return;
    }

    messages.push(ChatCompletionMessage {
        role: "assistant".to_string(),
        content: if texts.is_empty() {
            None
        } else {
            Some(ChatContent::Text(texts.join("\n\n")))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    });
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => {
            format!("data:{};base64,{}", media_type, data)
        }
        ImageSource::Url { url } => url.clone(),
    }
}

/// Extract plain text from tool_result content, which may be a string or a
/// block array.
fn flatten_block_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("\n\n")
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn map_tool(tool: ToolDefinition) -> FunctionTool {
    FunctionTool {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        },
    }
}

/// Translate tool_choice. `{"type": "any"}` → `"required"`,
/// `{"type": "tool", "name": ...}` → the function selector object, `auto`
/// passes through; anything without an upstream equivalent is dropped.
fn map_tool_choice(choice: Value) -> Option<Value> {
    match &choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(Value::String("auto".to_string())),
            "any" => Some(Value::String("required".to_string())),
            _ => None,
        },
        Value::Object(map) => match map.get("type").and_then(|t| t.as_str()) {
            Some("auto") => Some(Value::String("auto".to_string())),
            Some("any") => Some(Value::String("required".to_string())),
            Some("tool") => map.get("name").map(|name| {
                serde_json::json!({
                    "type": "function",
                    "function": {"name": name}
                })
            }),
            _ => None,
        },
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
