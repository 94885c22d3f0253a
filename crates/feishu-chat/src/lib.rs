//! feishu-chat: Conversation runtime with streamed replies
//!
//! This crate owns the conversation state machine: sending user messages,
//! streaming assistant replies into a pending placeholder, cancellation,
//! persistence through a [`MessageStore`] and state publishing.

pub mod controller;
pub mod conversation;
pub mod error;
pub mod events;
pub mod storage;
pub mod transport;

pub use controller::ConversationController;
pub use conversation::ConversationState;
pub use error::Error;
pub use events::ConversationEvent;
pub use storage::{MemoryStore, MessageStore, StorageError};
pub use transport::{ChatTransport, HttpTransport, RetryConfig};
