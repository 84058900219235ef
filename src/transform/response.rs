//! OpenAI to Anthropic response mapper.
//!
//! Converts a complete Chat Completions response into Messages API format.
//! Handles:
//! - `choices[0].message` → content block array
//! - `tool_calls` → tool_use blocks with parsed argument objects
//! - `finish_reason` → `stop_reason` via a fixed table
//! - `prompt_tokens`/`completion_tokens` → `input_tokens`/`output_tokens`

use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::schema::anthropic::{ContentBlock, MessagesResponse, StopReason, Usage};
use crate::schema::openai::{ChatContent, ChatResponse, ContentPart};

/// Map a complete upstream response onto the Messages API shape.
///
/// `model` is the model name the client asked for; it is echoed back even
/// when the upstream omits or rewrites its own `model` field. A response
/// without a usable `choices[0].message` is an [`BridgeError::UpstreamShape`]
/// failure, never coerced into a fabricated success.
pub fn map_response(response: ChatResponse, model: &str) -> Result<MessagesResponse, BridgeError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BridgeError::UpstreamShape("response has no choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| BridgeError::UpstreamShape("choice has no message".to_string()))?;

    let mut content: Vec<ContentBlock> = Vec::new();

    match message.content {
        Some(ChatContent::Text(text)) => {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }
        Some(ChatContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => content.push(ContentBlock::Text { text }),
                    ContentPart::ImageUrl { .. } => {
                        debug!("ignoring image part in upstream assistant message");
                    }
                }
            }
        }
        None => {}
    }

    for call in message.tool_calls.unwrap_or_default() {
        // The argument string is whatever the model emitted; a parse failure
        // degrades to an empty input object rather than failing the request.
        let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|err| {
            warn!(
                tool = %call.function.name,
                error = %err,
                "tool call arguments are not valid JSON, substituting empty input"
            );
            serde_json::json!({})
        });
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    if content.is_empty() {
        content.push(ContentBlock::Text {
            text: String::new(),
        });
    }

    let finish_reason = choice.finish_reason.as_deref().unwrap_or("stop");
    let stop_reason = map_finish_reason(finish_reason);
    debug!(from = finish_reason, to = ?stop_reason, "mapped upstream finish reason");

    Ok(MessagesResponse {
        id: response.id.unwrap_or_else(generated_message_id),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: response
            .usage
            .map(|usage| Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
    })
}

/// Map an upstream finish_reason onto a stop_reason.
///
/// Table:
/// - `stop` → `end_turn`
/// - `length` → `max_tokens`
/// - `tool_calls` / `function_call` → `tool_use`
/// - `content_filter` → `stop_sequence`
/// - anything else → `end_turn`
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::StopSequence,
        other => {
            debug!(reason = other, "unknown finish_reason, defaulting to end_turn");
            StopReason::EndTurn
        }
    }
}

pub(crate) fn generated_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Tests
// ============================================================================
