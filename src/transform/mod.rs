//! Pure schema mappers between the Anthropic and OpenAI request/response
//! shapes. Neither direction performs I/O; streaming translation lives in
//! `crate::stream`.

pub mod request;
pub mod response;

pub use request::map_request;
pub use response::{map_finish_reason, map_response};
