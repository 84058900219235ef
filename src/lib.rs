//! claude-bridge: an edge adapter that exposes the Anthropic Messages API on
//! top of any OpenAI-compatible Chat Completions backend.
//!
//! The interesting parts are the pure mappers in [`transform`] and the
//! per-request streaming state machine in [`stream`]; [`proxy`] wires them
//! to HTTP.

pub mod config;
pub mod error;
pub mod proxy;
pub mod schema;
pub mod sse;
pub mod stream;
pub mod transform;
