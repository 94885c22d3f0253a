//! Conversation history kept in a JSONL file

use async_trait::async_trait;
use feishu_ai::Message;
use feishu_chat::{MessageStore, StorageError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Message store backed by an append-only JSONL file.
///
/// Each save appends one serialized [`Message`]; when loading, a later line
/// replaces an earlier one with the same id.
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn save(&self, message: &Message) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
        let content = {
            let _guard = self.write_lock.lock().await;
            match fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
                Err(e) => return Err(e.into()),
            }
        };

        let mut messages: Vec<Message> = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = match serde_json::from_str(line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(line = index + 1, "skipping unreadable history entry: {}", e);
                    continue;
                }
            };
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message,
                None => messages.push(message),
            }
        }
        Ok(messages)
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
