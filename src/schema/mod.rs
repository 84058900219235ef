//! Typed models of the two API surfaces the adapter translates between.
//!
//! `anthropic` covers the Messages API the adapter speaks to clients;
//! `openai` covers the Chat Completions API it speaks upstream. Both sides
//! model content as tagged sum types so the translation boundaries in
//! `crate::transform` and `crate::stream` match exhaustively.

pub mod anthropic;
pub mod openai;
