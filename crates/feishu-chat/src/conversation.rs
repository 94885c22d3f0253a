//! Conversation state: messages, reply status, loading status and last error.

use feishu_ai::{Message, MessageId};

/// Snapshot of one conversation, as published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    /// Messages in insertion order
    pub messages: Vec<Message>,
    /// True exactly while a reply request is outstanding
    pub awaiting_reply: bool,
    /// Last error, cleared when a new operation starts
    pub last_error: Option<String>,
    /// True while history is being loaded from the store
    pub is_loading: bool,
    /// True once history loading has run
    pub is_initialized: bool,
    /// Draft text of the caller's input field
    pub current_input: String,
}

impl ConversationState {
    /// Neither loading history nor waiting for a reply
    pub fn is_idle(&self) -> bool {
        !self.is_loading && !self.awaiting_reply
    }

    /// The assistant message currently being streamed into, if any
    pub fn pending_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.pending)
    }

    /// Number of pending messages (never more than one)
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.pending).count()
    }

    pub(crate) fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Remove the message with `id`, returning whether it was present
    pub(crate) fn remove_message(&mut self, id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() != before
    }
}
