//! Transcoding between the Anthropic Messages protocol and the
//! OpenAI-compatible chat-completions protocol.
//!
//! `request` converts an inbound Anthropic request into an outbound OpenAI
//! request. `response` converts a buffered (non-streaming) OpenAI response
//! back into an Anthropic response. The streaming case, which needs
//! additional per-request bookkeeping, lives in `crate::proxy::sse`.

pub mod request;
pub mod response;

pub use request::{translate_request, TranslatedRequest};
pub use response::translate_response;
