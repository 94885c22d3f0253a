//! Transport abstraction for opening chat streams

use std::time::Duration;

use async_trait::async_trait;
use feishu_ai::{ByteStream, ChatClient, Message, Result};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Opens a streaming reply for a conversation history.
///
/// The returned body is decoded by the controller; the transport only has to
/// serialize `history` and hand back the raw event stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_chat_stream(&self, history: Vec<Message>) -> Result<ByteStream>;
}

/// Transport that calls the chat-completions endpoint over HTTP
pub struct HttpTransport {
    client: ChatClient,
    retry_config: RetryConfig,
}

impl HttpTransport {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            retry_config: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_chat_stream(&self, history: Vec<Message>) -> Result<ByteStream> {
        let mut attempt = 0u32;

        loop {
            match self.client.open_stream(&history).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.retry_config.max_retries && e.is_retryable() => {
                    let delay = self.retry_config.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        self.retry_config.max_retries + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
