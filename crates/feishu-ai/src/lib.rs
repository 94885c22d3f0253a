//! feishu-ai: chat-completions client and SSE stream decoding
//!
//! This crate provides the message model shared by the conversation runtime,
//! the decoder that turns an event-stream response body into text fragments,
//! and an HTTP client for the upstream chat-completions endpoint.

pub mod client;
pub mod error;
pub mod stream;
pub mod types;

pub use client::ChatClient;
pub use error::{Error, Result};
pub use stream::{ByteStream, DecodeError, StreamDecoder, StreamEvent};
pub use types::*;
