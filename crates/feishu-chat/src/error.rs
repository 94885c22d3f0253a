//! Error types for feishu-chat

use feishu_ai::DecodeError;
use thiserror::Error;

use crate::storage::StorageError;

/// Failures of a conversation operation.
///
/// These never escape the controller: they are rendered into
/// `ConversationState::last_error` and an `Error` event.
#[derive(Error, Debug)]
pub enum Error {
    /// Opening the chat stream failed
    #[error("request failed: {0}")]
    Transport(#[from] feishu_ai::Error),

    /// The response body failed after the stream was opened
    #[error("reply interrupted: {0}")]
    Stream(DecodeError),

    /// The message store rejected a save, load or clear
    #[error(transparent)]
    Storage(#[from] StorageError),
}
