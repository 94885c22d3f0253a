//! Conversation event types

use feishu_ai::{Message, MessageId};
use serde::{Deserialize, Serialize};

/// Events emitted while a conversation changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// History was (re)loaded from the store
    HistoryLoaded { count: usize },

    /// A user message was appended
    MessageAppended { message: Message },

    /// A pending assistant reply was opened
    ReplyStarted { message_id: MessageId },

    /// Text was appended to the pending reply
    Fragment { message_id: MessageId, delta: String },

    /// The pending reply was finalized
    ReplyFinished { message: Message },

    /// The pending reply was dropped because the request failed
    ReplyFailed { message_id: MessageId, error: String },

    /// The pending reply was dropped because the request was stopped or superseded
    ReplyCancelled { message_id: MessageId },

    /// All messages were removed
    Cleared,

    /// A failure that did not end a reply (storage)
    Error { message: String },
}

impl ConversationEvent {
    /// Check if this event ends a reply
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationEvent::ReplyFinished { .. }
                | ConversationEvent::ReplyFailed { .. }
                | ConversationEvent::ReplyCancelled { .. }
        )
    }
}
