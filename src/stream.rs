//! Streaming transcoder: OpenAI delta chunks in, Anthropic events out.
//!
//! One [`StreamTranscoder`] owns the mutable state for a single response
//! stream. It is a single-pass, no-lookahead transform: each upstream chunk
//! produces zero or more Anthropic events immediately, with no buffering
//! beyond the current chunk. The state machine is `AwaitingStart` (nothing
//! emitted) → `Streaming` (after `message_start`) → `Closed` (after
//! `message_stop`), tracked by the `started`/`closed` flags.
//!
//! Invariants:
//! - Anthropic block indices are assigned in first-seen order and never
//!   reused; fragments of one upstream tool call always map to the same
//!   index, even if the upstream interleaves slots. Text resuming after its
//!   block closed starts a new block, so deltas only ever land on the open
//!   block.
//! - The open block is closed with `content_block_stop` before any event for
//!   a different index, and before the terminal `message_delta`.
//! - Every stream that starts is terminated: `finish()` synthesizes the
//!   closing events when the upstream ends without a finish_reason.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::schema::anthropic::{
    BlockDelta, ContentBlock, MessageDelta, MessagesResponse, StopReason, StreamEvent, Usage,
};
use crate::schema::openai::{ChatChunk, ToolCallDelta};
use crate::transform::response::generated_message_id;
use crate::transform::map_finish_reason;

/// Per-request streaming state. Created when the upstream response starts,
/// discarded when the stream ends or the client disconnects. Never shared.
pub struct StreamTranscoder {
    model: String,
    message_id: Option<String>,
    started: bool,
    closed: bool,
    next_index: usize,
    /// Anthropic index of the currently open content block, if any.
    open_block: Option<usize>,
    /// Anthropic index of the open text block. Cleared when the block
    /// closes; text arriving later starts a fresh block rather than
    /// emitting deltas on a stopped index.
    text_index: Option<usize>,
    /// Upstream tool-call index → assigned block index + argument buffer.
    tool_slots: HashMap<u32, ToolSlot>,
    usage: Usage,
}

struct ToolSlot {
    index: usize,
    arguments: String,
}

impl StreamTranscoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: None,
            started: false,
            closed: false,
            next_index: 0,
            open_block: None,
            text_index: None,
            tool_slots: HashMap::new(),
            usage: Usage::default(),
        }
    }

    /// Process one upstream SSE `data:` payload.
    ///
    /// The `[DONE]` sentinel routes to [`finish`](Self::finish). A payload
    /// that fails to parse is dropped with a warning and the stream
    /// continues; forward progress beats strict handling of one corrupt
    /// chunk.
    pub fn handle_data(&mut self, payload: &str) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        if payload.trim() == "[DONE]" {
            return self.finish();
        }
        match serde_json::from_str::<ChatChunk>(payload) {
            Ok(chunk) => self.handle_chunk(chunk),
            Err(err) => {
                warn!(error = %err, "skipping malformed upstream chunk");
                Vec::new()
            }
        }
    }

    fn handle_chunk(&mut self, chunk: ChatChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if let Some(id) = chunk.id {
            self.message_id.get_or_insert(id);
        }
        if let Some(usage) = chunk.usage {
            self.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            // usage-only or heartbeat chunk
            return out;
        };

        let text = choice.delta.content.filter(|content| !content.is_empty());
        let tool_deltas = choice.delta.tool_calls.unwrap_or_default();

        // `message_start` goes out exactly once, on the first content-bearing
        // chunk. Role-only preambles contribute id/model but emit nothing.
        let content_bearing =
            text.is_some() || !tool_deltas.is_empty() || choice.finish_reason.is_some();
        if content_bearing && !self.started {
            out.push(self.message_start_event());
        }

        if let Some(text) = text {
            self.emit_text_delta(text, &mut out);
        }

        for call in tool_deltas {
            self.emit_tool_delta(call, &mut out);
        }

        if let Some(reason) = choice.finish_reason {
            self.close_open_block(&mut out);
            out.push(StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: map_finish_reason(&reason),
                    stop_sequence: None,
                },
                usage: self.usage.clone(),
            });
            out.push(StreamEvent::MessageStop);
            self.closed = true;
        }

        out
    }

    /// Terminate the stream, synthesizing whatever closing events the
    /// upstream never sent. Idempotent once the stream is closed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.started {
            // The upstream died before producing anything; still hand the
            // client a complete envelope.
            out.push(self.message_start_event());
        }
        self.close_open_block(&mut out);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: StopReason::EndTurn,
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        out.push(StreamEvent::MessageStop);
        self.closed = true;
        out
    }

    fn message_start_event(&mut self) -> StreamEvent {
        self.started = true;
        let id = self
            .message_id
            .get_or_insert_with(generated_message_id)
            .clone();
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id,
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    fn emit_text_delta(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        // text_index is Some only while its block is open, so the Some arm
        // never emits a delta on a stopped block.
        let index = match self.text_index {
            Some(index) => index,
            None => {
                self.close_open_block(out);
                let index = self.alloc_index();
                self.text_index = Some(index);
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                self.open_block = Some(index);
                index
            }
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta { text },
        });
    }

    fn emit_tool_delta(&mut self, call: ToolCallDelta, out: &mut Vec<StreamEvent>) {
        let index = match self.tool_slots.get(&call.index) {
            Some(slot) => {
                let index = slot.index;
                if self.open_block != Some(index) {
                    // Fragments for an already-closed call keep their index.
                    self.close_open_block(out);
                }
                index
            }
            None => {
                self.close_open_block(out);
                let index = self.alloc_index();
                let id = call
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_default();
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
                self.open_block = Some(index);
                self.tool_slots.insert(
                    call.index,
                    ToolSlot {
                        index,
                        arguments: String::new(),
                    },
                );
                index
            }
        };

        let fragment = call
            .function
            .and_then(|function| function.arguments)
            .filter(|fragment| !fragment.is_empty());
        if let Some(fragment) = fragment {
            if let Some(slot) = self.tool_slots.get_mut(&call.index) {
                slot.arguments.push_str(&fragment);
            }
            // The raw fragment is forwarded as-is; the accumulated buffer is
            // only consulted when the block closes.
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: fragment,
                },
            });
        }
    }

    fn close_open_block(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_block.take() {
            if self.text_index == Some(index) {
                self.text_index = None;
            }
            if let Some(slot) = self.tool_slots.values().find(|slot| slot.index == index) {
                if !slot.arguments.is_empty()
                    && serde_json::from_str::<serde_json::Value>(&slot.arguments).is_err()
                {
                    // Partial fragments went out as-is; no repair attempted.
                    debug!(index, "tool block closed with incomplete argument JSON");
                }
            }
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn alloc_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunk(text: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
        })
        .to_string()
    }

    fn finish_chunk(reason: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-test",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
        })
        .to_string()
    }

    fn tool_start_chunk(tool_index: u32, id: &str, name: &str) -> String {
        serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": tool_index,
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": ""}
            }]}}]
        })
        .to_string()
    }

    fn tool_args_chunk(tool_index: u32, fragment: &str) -> String {
        serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": tool_index,
                "function": {"arguments": fragment}
            }]}}]
        })
        .to_string()
    }

    fn run(payloads: &[&str]) -> Vec<StreamEvent> {
        let mut transcoder = StreamTranscoder::new("test-model");
        let mut events: Vec<StreamEvent> = Vec::new();
        for payload in payloads {
            events.extend(transcoder.handle_data(payload));
        }
        events.extend(transcoder.finish());
        events
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[test]
    fn text_stream_produces_canonical_event_sequence() {
        let events = run(&[&text_chunk("Hel"), &text_chunk("lo"), &finish_chunk("stop")]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[1] {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Text { .. },
            } => assert_eq!(*index, 0),
            other => panic!("expected text block start, got {other:?}"),
        }
        match (&events[2], &events[3]) {
            (
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text: first },
                    ..
                },
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text: second },
                    ..
                },
            ) => {
                assert_eq!(first, "Hel");
                assert_eq!(second, "lo");
            }
            other => panic!("expected two text deltas, got {other:?}"),
        }
        match &events[5] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn message_start_carries_upstream_id_and_model() {
        let events = run(&[&text_chunk("hi"), &finish_chunk("stop")]);
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "chatcmpl-test");
                assert_eq!(message.model, "test-model");
                assert_eq!(message.role, "assistant");
                assert!(message.content.is_empty());
                assert_eq!(message.usage, Usage::default());
            }
            other => panic!("expected message_start, got {other:?}"),
        }
    }

    #[test]
    fn role_only_preamble_does_not_start_the_message() {
        let preamble = serde_json::json!({
            "id": "chatcmpl-pre",
            "choices": [{"delta": {"role": "assistant"}, "finish_reason": null}]
        })
        .to_string();

        let mut transcoder = StreamTranscoder::new("test-model");
        assert!(transcoder.handle_data(&preamble).is_empty());

        let events = transcoder.handle_data(&text_chunk("hi"));
        match &events[0] {
            StreamEvent::MessageStart { message } => assert_eq!(message.id, "chatcmpl-pre"),
            other => panic!("expected message_start, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_fragments_accumulate_under_one_index() {
        let events = run(&[
            &tool_start_chunk(0, "call_1", "get_weather"),
            &tool_args_chunk(0, "{\"city\""),
            &tool_args_chunk(0, ": \"Paris\"}"),
            &finish_chunk("tool_calls"),
        ]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[1] {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, input },
            } => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input, &serde_json::json!({}));
            }
            other => panic!("expected tool_use block start, got {other:?}"),
        }

        let fragments: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments.join(""), "{\"city\": \"Paris\"}");

        match &events[5] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, StopReason::ToolUse);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn text_block_closes_before_tool_block_starts() {
        let events = run(&[
            &text_chunk("Let me check"),
            &tool_start_chunk(0, "call_1", "get_weather"),
            &tool_args_chunk(0, "{}"),
            &finish_chunk("tool_calls"),
        ]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",    // text, index 0
                "content_block_delta",
                "content_block_stop",     // text closed before the tool opens
                "content_block_start",    // tool_use, index 1
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[4] {
            StreamEvent::ContentBlockStart { index, .. } => assert_eq!(*index, 1),
            other => panic!("expected tool block start, got {other:?}"),
        }
    }

    #[test]
    fn text_resuming_after_tool_call_opens_a_new_block() {
        let events = run(&[
            &text_chunk("a"),
            &tool_start_chunk(0, "call_1", "f"),
            &tool_args_chunk(0, "{}"),
            &text_chunk("b"),
            &finish_chunk("stop"),
        ]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",  // text, index 0
                "content_block_delta",
                "content_block_stop",
                "content_block_start",  // tool_use, index 1
                "content_block_delta",
                "content_block_stop",
                "content_block_start",  // text again, fresh index 2
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[7] {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Text { .. },
            } => assert_eq!(*index, 2),
            other => panic!("expected a new text block start, got {other:?}"),
        }
        match &events[8] {
            StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::TextDelta { text },
            } => {
                assert_eq!(*index, 2);
                assert_eq!(text, "b");
            }
            other => panic!("expected text delta on the new block, got {other:?}"),
        }
    }

    #[test]
    fn block_lifecycle_pairs_starts_and_stops() {
        let events = run(&[
            &text_chunk("a"),
            &tool_start_chunk(0, "call_1", "f"),
            &tool_args_chunk(0, "{\"x\":1}"),
            &tool_start_chunk(1, "call_2", "g"),
            &tool_args_chunk(1, "{\"y\":2}"),
            &finish_chunk("tool_calls"),
        ]);

        let mut starts: Vec<usize> = Vec::new();
        let mut stops: Vec<usize> = Vec::new();
        for event in &events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => starts.push(*index),
                StreamEvent::ContentBlockStop { index } => stops.push(*index),
                _ => {}
            }
        }

        // first-seen order, no index reuse
        assert_eq!(starts, vec![0, 1, 2]);
        let mut sorted_stops = stops.clone();
        sorted_stops.sort_unstable();
        assert_eq!(sorted_stops, vec![0, 1, 2]);
        // each start precedes its stop
        for index in starts {
            let start_at = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ContentBlockStart { index: i, .. } if *i == index))
                .unwrap();
            let stop_at = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ContentBlockStop { index: i } if *i == index))
                .unwrap();
            assert!(start_at < stop_at);
        }
    }

    #[test]
    fn interleaved_fragments_keep_their_assigned_index() {
        let events = run(&[
            &tool_start_chunk(0, "call_1", "f"),
            &tool_start_chunk(1, "call_2", "g"),
            // upstream reorders: a late fragment for call 0
            &tool_args_chunk(0, "{\"late\":true}"),
            &finish_chunk("tool_calls"),
        ]);

        let late = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta { partial_json },
                } if partial_json.contains("late") => Some(*index),
                _ => None,
            })
            .expect("late fragment should be emitted");
        assert_eq!(late, 0, "fragment must stay correlated to its original index");
    }

    #[test]
    fn malformed_chunk_is_skipped_without_breaking_the_stream() {
        let events = run(&[
            &text_chunk("Hel"),
            "{not valid json",
            &text_chunk("lo"),
            &finish_chunk("stop"),
        ]);

        let text: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(names(&events).last(), Some(&"message_stop"));
    }

    #[test]
    fn done_sentinel_synthesizes_termination() {
        let mut transcoder = StreamTranscoder::new("test-model");
        let mut events = transcoder.handle_data(&text_chunk("hi"));
        events.extend(transcoder.handle_data("[DONE]"));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        match events
            .iter()
            .find(|event| matches!(event, StreamEvent::MessageDelta { .. }))
        {
            Some(StreamEvent::MessageDelta { delta, .. }) => {
                assert_eq!(delta.stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn bare_termination_still_yields_a_complete_envelope() {
        let mut transcoder = StreamTranscoder::new("test-model");
        let events = transcoder.finish();
        assert_eq!(
            names(&events),
            vec!["message_start", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn finish_is_idempotent_after_close() {
        let mut transcoder = StreamTranscoder::new("test-model");
        transcoder.handle_data(&text_chunk("hi"));
        transcoder.handle_data(&finish_chunk("stop"));
        assert!(transcoder.finish().is_empty());
        assert!(transcoder.handle_data(&text_chunk("late")).is_empty());
    }

    #[test]
    fn usage_on_finish_chunk_reaches_message_delta() {
        let finish_with_usage = serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        })
        .to_string();

        let events = run(&[&text_chunk("hi"), &finish_with_usage]);
        match events
            .iter()
            .find(|event| matches!(event, StreamEvent::MessageDelta { .. }))
        {
            Some(StreamEvent::MessageDelta { usage, .. }) => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        let events = run(&[&text_chunk("hi"), &finish_chunk("length")]);
        match events
            .iter()
            .find(|event| matches!(event, StreamEvent::MessageDelta { .. }))
        {
            Some(StreamEvent::MessageDelta { delta, .. }) => {
                assert_eq!(delta.stop_reason, StopReason::MaxTokens);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn mid_argument_termination_closes_block_without_repair() {
        let events = run(&[
            &tool_start_chunk(0, "call_1", "f"),
            &tool_args_chunk(0, "{\"truncat"),
            // stream dies here; run() calls finish()
        ]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        match &events[2] {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::InputJsonDelta { partial_json },
                ..
            } => assert_eq!(partial_json, "{\"truncat"),
            other => panic!("expected input_json_delta, got {other:?}"),
        }
    }
}
