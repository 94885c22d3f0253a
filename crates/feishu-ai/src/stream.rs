//! Server-Sent-Events decoding for chat-completion response bodies

use async_stream::stream;
use serde::Deserialize;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// A buffered response body, read one line at a time by the decoder
pub type ByteStream = Pin<Box<dyn AsyncBufRead + Send>>;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Events produced while decoding a response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental piece of assistant text (may be empty)
    Fragment(String),
    /// The `[DONE]` sentinel was received
    Done,
    /// A line could not be decoded, or reading failed
    DecodeError(DecodeError),
}

impl StreamEvent {
    /// Check if no further events follow this one
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Done => true,
            StreamEvent::DecodeError(e) => e.is_terminal(),
            StreamEvent::Fragment(_) => false,
        }
    }
}

/// Failure while decoding the event stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A `data:` payload was not a valid chunk; decoding continues
    #[error("malformed event on line {line}: {message}")]
    Malformed { line: usize, message: String },

    /// The body could not be read; decoding stops
    #[error("stream read failed: {0}")]
    Io(String),
}

impl DecodeError {
    /// Check if this error ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecodeError::Io(_))
    }
}

// Streaming response types. Every field is optional so that role-only and
// finish-only chunks decode cleanly.

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    role: Option<String>,
    content: Option<String>,
}

/// Decode a single line of an event stream.
///
/// Returns `None` for lines that carry no event: blank lines and anything
/// that is not a `data: ` field. `line` is the 1-based line number used in
/// error reports.
pub fn decode_line(line: usize, text: &str) -> Option<StreamEvent> {
    let payload = text.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => {
            let Some(choice) = chunk.choices.into_iter().next() else {
                return Some(StreamEvent::Fragment(String::new()));
            };
            if let Some(ref reason) = choice.finish_reason {
                tracing::debug!(finish_reason = %reason, "choice finished");
            }
            let delta = choice.delta.unwrap_or(StreamDelta {
                role: None,
                content: None,
            });
            if delta.content.is_none() {
                if let Some(ref role) = delta.role {
                    tracing::trace!(role = %role, "role-only delta");
                }
            }
            Some(StreamEvent::Fragment(delta.content.unwrap_or_default()))
        }
        Err(e) => Some(StreamEvent::DecodeError(DecodeError::Malformed {
            line,
            message: e.to_string(),
        })),
    }
}

/// Turns a line-oriented body into an ordered sequence of [`StreamEvent`]s.
///
/// The decoder owns its source. The source is dropped when the returned
/// stream finishes (sentinel, end of input, read failure or cancellation) or
/// when the consumer drops the stream early.
pub struct StreamDecoder<R> {
    reader: R,
}

impl<R> StreamDecoder<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Consume the decoder and produce its events.
    ///
    /// `cancel` is raced against every line read; once it fires no further
    /// events are produced.
    pub fn decode(self, cancel: CancellationToken) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let mut lines = self.reader.lines();

        stream! {
            let mut line_no = 0usize;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = lines.next_line() => Some(next),
                };
                let Some(next) = next else {
                    tracing::debug!(lines = line_no, "decode cancelled");
                    break;
                };

                match next {
                    Ok(Some(line)) => {
                        line_no += 1;
                        let Some(event) = decode_line(line_no, &line) else {
                            continue;
                        };
                        if let StreamEvent::DecodeError(ref e) = event {
                            tracing::warn!("skipping event: {}", e);
                        }
                        let done = event == StreamEvent::Done;
                        yield event;
                        if done {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(lines = line_no, "event stream exhausted without sentinel");
                        break;
                    }
                    Err(e) => {
                        yield StreamEvent::DecodeError(DecodeError::Io(e.to_string()));
                        break;
                    }
                }
            }

            drop(lines);
        }
    }
}
