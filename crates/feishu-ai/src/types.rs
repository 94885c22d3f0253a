//! Core types for chat conversations

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a message, unique and increasing within one conversation
pub type MessageId = u64;

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Assistant,
}

impl Origin {
    /// Role string used by the chat-completions API
    pub fn role(&self) -> &'static str {
        match self {
            Origin::User => "user",
            Origin::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Accumulated text content
    pub text: String,
    pub origin: Origin,
    /// True while an assistant reply is still being streamed into this message
    #[serde(default)]
    pub pending: bool,
    /// Creation time in Unix milliseconds
    pub created_at: i64,
}

impl Message {
    /// Create a user message with text content
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            origin: Origin::User,
            pending: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an empty, pending assistant message
    pub fn assistant_placeholder(id: MessageId) -> Self {
        Self {
            id,
            text: String::new(),
            origin: Origin::Assistant,
            pending: true,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a finished assistant message
    pub fn assistant(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            pending: false,
            text: text.into(),
            ..Self::assistant_placeholder(id)
        }
    }

    /// Check if the user wrote this message
    pub fn is_user(&self) -> bool {
        self.origin == Origin::User
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        self.origin.role()
    }
}

/// Upstream model and endpoint definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatModel {
    /// Model identifier sent in the request body
    pub id: String,
    /// Base URL; the completions path is appended to it
    pub base_url: String,
    /// Additional headers for API calls
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ChatModel {
    /// Create a model definition for the given endpoint
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            headers: HashMap::new(),
        }
    }
}
