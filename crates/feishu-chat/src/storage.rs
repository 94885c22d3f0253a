//! Message persistence boundary

use async_trait::async_trait;
use feishu_ai::Message;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors reported by a [`MessageStore`]
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persists finished conversation messages.
///
/// The controller calls `save` for each user message and each finalized
/// assistant reply, `load_all` when (re)initializing and `clear_all` when the
/// conversation is cleared. Failures never undo in-memory changes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message, replacing any stored message with the same id
    async fn save(&self, message: &Message) -> Result<(), StorageError>;

    /// Load every stored message in insertion order
    async fn load_all(&self) -> Result<Vec<Message>, StorageError>;

    /// Drop all stored messages
    async fn clear_all(&self) -> Result<(), StorageError>;
}

/// In-process store, used when nothing outlives the session
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `messages`
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    /// Copy of the stored messages
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<(), StorageError> {
        let mut messages = self.messages.lock();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        Ok(self.messages())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.messages.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_save_replaces_same_id() {
        let store = MemoryStore::new();
        store.save(&Message::user(1, "hello")).await.unwrap();
        store.save(&Message::assistant(2, "Hi")).await.unwrap();
        store.save(&Message::assistant(2, "Hi!")).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].text, "Hi!");
    }

    #[tokio::test]
    async fn test_memory_store_clear() {
        let store = MemoryStore::with_messages(vec![Message::user(1, "a")]);
        store.clear_all().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
