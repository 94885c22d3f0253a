//! Chat Completions API client

use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;

use crate::{
    error::{Error, Result},
    stream::ByteStream,
    types::{ChatModel, Message},
};

/// Path of the streaming completions endpoint, relative to the base URL
pub const COMPLETIONS_PATH: &str = "/api/v3/chat/completions";

/// Environment variable holding the API key when none is configured
pub const API_KEY_ENV: &str = "ARK_API_KEY";

/// Chat-completions client
pub struct ChatClient {
    client: reqwest::Client,
    api_key: String,
    model: ChatModel,
}

impl ChatClient {
    /// Create a new client with an API key
    pub fn new(api_key: impl Into<String>, model: ChatModel) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model,
        }
    }

    /// Open a streaming completion for `history` and return the raw body.
    ///
    /// The body is handed back unread so the caller decides how to decode it
    /// and when to release it.
    pub async fn open_stream(&self, history: &[Message]) -> Result<ByteStream> {
        if self.model.base_url.is_empty() {
            return Err(Error::InvalidConfig("base URL is empty".to_string()));
        }

        let request = build_request(&self.model, history);
        let url = format!(
            "{}{}",
            self.model.base_url.trim_end_matches('/'),
            COMPLETIONS_PATH
        );

        let mut headers = reqwest::header::HeaderMap::new();
        let auth: reqwest::header::HeaderValue = format!("Bearer {}", self.api_key)
            .parse()
            .map_err(|_| Error::InvalidApiKey)?;
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/event-stream"),
        );

        // Add model-specific headers
        for (key, value) in &self.model.headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }

        tracing::debug!(
            url = %url,
            model = %self.model.id,
            messages = request.messages.len(),
            "opening chat stream"
        );

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), text));
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}

fn build_request(model: &ChatModel, history: &[Message]) -> ChatRequest {
    let messages = history
        .iter()
        .filter(|m| !m.pending)
        .map(|m| ChatMessage {
            role: m.role().to_string(),
            content: m.text.clone(),
        })
        .collect();

    ChatRequest {
        model: model.id.clone(),
        messages,
        stream: true,
    }
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}
