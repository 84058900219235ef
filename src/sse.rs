//! SSE plumbing for the streaming path.
//!
//! [`SseParser`] reassembles upstream `text/event-stream` bytes into frames
//! regardless of how the network fragments them. [`encode_event`] writes
//! Anthropic named events. [`stream_response`] bridges the two through a
//! [`StreamTranscoder`] into an axum response body.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::schema::anthropic::StreamEvent;
use crate::stream::StreamTranscoder;

/// One reassembled upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// The joined `data:` payload of the frame.
    Data(String),
    /// A comment-only frame (`: keep-alive`). Forwarded as a ping.
    Comment,
}

/// Incremental SSE frame parser.
///
/// Buffers raw bytes across `push` calls and yields only complete frames
/// (terminated by a blank line), so a `data:` payload split across TCP
/// reads, even mid-character, is reassembled before it reaches the
/// transcoder.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, skip)) = frame_boundary(&self.buffer) {
            // Frame boundaries are ASCII, so decoding at frame granularity
            // never splits a multi-byte character.
            let frame = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..skip);
            if let Some(parsed) = parse_frame(&frame) {
                frames.push(parsed);
            }
        }
        frames
    }
}

/// Locate the first blank-line terminator (`\n\n` or `\n\r\n`), returning
/// (frame end, bytes to consume).
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' {
            if buffer[i + 1] == b'\n' {
                return Some((i, i + 2));
            }
            if i + 2 < buffer.len() && buffer[i + 1] == b'\r' && buffer[i + 2] == b'\n' {
                return Some((i, i + 3));
            }
        }
        i += 1;
    }
    None
}

fn parse_frame(frame: &str) -> Option<SseFrame> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_comment = false;

    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(':') {
            saw_comment = true;
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // `event:`/`id:`/`retry:` fields are irrelevant upstream; skipped.
    }

    if !data_lines.is_empty() {
        Some(SseFrame::Data(data_lines.join("\n")))
    } else if saw_comment {
        Some(SseFrame::Comment)
    } else {
        None
    }
}

/// Encode one Anthropic event as a named SSE frame.
pub fn encode_event(event: &StreamEvent) -> Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", event.name(), payload))
}

/// Pipe an upstream streaming response through the transcoder into an SSE
/// response for the client.
///
/// A single task owns the transcoder state. Events are forwarded at the rate
/// the upstream produces them through a bounded channel, so memory stays
/// bounded regardless of response length. If the client disconnects, the
/// channel send fails, the task returns, and dropping `resp` aborts the
/// upstream fetch.
pub fn stream_response(resp: reqwest::Response, model: String, buffer_size: usize) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(buffer_size.max(1));

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut transcoder = StreamTranscoder::new(model);
        let mut upstream = resp.bytes_stream();

        'read: while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "upstream stream failed mid-response");
                    break;
                }
            };

            for frame in parser.push(&bytes) {
                let events = match frame {
                    SseFrame::Data(payload) => transcoder.handle_data(&payload),
                    // upstream keep-alive → Anthropic ping heartbeat
                    SseFrame::Comment => vec![StreamEvent::Ping],
                };
                for event in &events {
                    if tx.send(Ok(encode_event(event))).await.is_err() {
                        debug!("client disconnected, aborting upstream stream");
                        break 'read;
                    }
                }
            }
        }

        // Synthesize termination if the upstream never sent one.
        for event in &transcoder.finish() {
            if tx.send(Ok(encode_event(event))).await.is_err() {
                break;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

// ============================================================================
// Tests
// ============================================================================
