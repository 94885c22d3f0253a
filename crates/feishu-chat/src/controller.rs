//! Conversation controller: owns conversation state and drives streamed replies

use std::sync::Arc;

use feishu_ai::{Message, MessageId, StreamDecoder, StreamEvent};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    conversation::ConversationState,
    error::Error,
    events::ConversationEvent,
    storage::MessageStore,
    transport::ChatTransport,
};

/// Drives one conversation.
///
/// All mutations go through a single lock and publish a fresh
/// [`ConversationState`] snapshot before the lock is released. At most one
/// reply is in flight; starting another cancels the previous one. Cloning
/// is cheap and every clone controls the same conversation.
///
/// Store calls are serialized. Every save carries the clear generation that
/// was current when its message was created, and is skipped once a later
/// `clear` has run.
#[derive(Clone)]
pub struct ConversationController {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<ConversationState>,
    event_tx: broadcast::Sender<ConversationEvent>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn MessageStore>,
    store_lock: tokio::sync::Mutex<()>,
}

struct Inner {
    state: ConversationState,
    next_message_id: MessageId,
    next_operation: u64,
    /// Bumped by every `clear`
    store_generation: u64,
    active: Option<ActiveReply>,
}

/// The reply currently being streamed
struct ActiveReply {
    operation: u64,
    message_id: MessageId,
    cancel: CancellationToken,
}

impl Inner {
    fn allocate_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    fn is_active(&self, operation: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.operation == operation)
    }
}

impl ConversationController {
    /// Create a controller with an empty conversation
    pub fn new(transport: Arc<dyn ChatTransport>, store: Arc<dyn MessageStore>) -> Self {
        let (snapshot_tx, _) = watch::channel(ConversationState::default());
        let (event_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConversationState::default(),
                    next_message_id: 1,
                    next_operation: 1,
                    store_generation: 0,
                    active: None,
                }),
                snapshot_tx,
                event_tx,
                transport,
                store,
                store_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Subscribe to state snapshots
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Subscribe to conversation events
    pub fn events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Get the current state
    pub fn state(&self) -> ConversationState {
        self.shared.inner.lock().state.clone()
    }

    /// Whether a reply is currently being streamed
    pub fn is_busy(&self) -> bool {
        self.shared.inner.lock().active.is_some()
    }

    /// Wait until no reply is outstanding.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| !s.awaiting_reply).await;
    }

    /// Replace the draft input text
    pub fn update_input(&self, text: impl Into<String>) {
        let mut inner = self.shared.inner.lock();
        inner.state.current_input = text.into();
        self.shared.publish(&inner);
    }

    /// Load stored history, replacing the in-memory messages.
    ///
    /// Any reply in flight is cancelled first, and sends are refused until
    /// loading ends.
    pub async fn initialize(&self) {
        {
            let mut inner = self.shared.inner.lock();
            self.shared.cancel_active(&mut inner);
            inner.state.is_loading = true;
            inner.state.last_error = None;
            self.shared.publish(&inner);
        }

        let loaded = {
            let _guard = self.shared.store_lock.lock().await;
            self.shared.store.load_all().await
        };

        let mut inner = self.shared.inner.lock();
        match loaded {
            Ok(mut messages) => {
                // A stored reply can never resume streaming.
                for message in &mut messages {
                    message.pending = false;
                }
                messages.sort_by_key(|m| m.id);
                if let Some(max_id) = messages.iter().map(|m| m.id).max() {
                    inner.next_message_id = inner.next_message_id.max(max_id + 1);
                }
                let count = messages.len();
                inner.state.messages = messages;
                tracing::debug!(count, "history loaded");
                self.shared.emit(ConversationEvent::HistoryLoaded { count });
            }
            Err(e) => {
                let message = format!("load failed: {}", Error::Storage(e));
                tracing::warn!("{}", message);
                inner.state.last_error = Some(message.clone());
                self.shared.emit(ConversationEvent::Error { message });
            }
        }
        inner.state.is_loading = false;
        inner.state.is_initialized = true;
        self.shared.publish(&inner);
    }

    /// Reset and load history again
    pub async fn reload(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.state.is_initialized = false;
            inner.state.last_error = None;
            self.shared.publish(&inner);
        }
        self.initialize().await;
    }

    /// Send a user message and start streaming the assistant reply.
    ///
    /// Blank input, or any input while history is loading, is ignored and
    /// returns `None`. Otherwise the user message
    /// and a pending assistant placeholder are visible in the state before
    /// this returns; the returned task finishes once the reply has been
    /// finalized, failed or been cancelled.
    pub fn send_message(&self, text: &str) -> Option<JoinHandle<()>> {
        if text.trim().is_empty() {
            return None;
        }

        let shared = Arc::clone(&self.shared);
        let (operation, generation, history, user_message, cancel) = {
            let mut inner = shared.inner.lock();
            if inner.state.is_loading {
                tracing::debug!("send ignored while history is loading");
                return None;
            }
            shared.cancel_active(&mut inner);

            let user_message = Message::user(inner.allocate_id(), text);
            let placeholder_id = inner.allocate_id();
            inner.state.messages.push(user_message.clone());
            let history: Vec<Message> = inner
                .state
                .messages
                .iter()
                .filter(|m| !m.pending)
                .cloned()
                .collect();
            inner
                .state
                .messages
                .push(Message::assistant_placeholder(placeholder_id));
            inner.state.awaiting_reply = true;
            inner.state.last_error = None;
            inner.state.current_input.clear();

            let operation = inner.next_operation;
            inner.next_operation += 1;
            let cancel = CancellationToken::new();
            inner.active = Some(ActiveReply {
                operation,
                message_id: placeholder_id,
                cancel: cancel.clone(),
            });

            shared.publish(&inner);
            shared.emit(ConversationEvent::MessageAppended {
                message: user_message.clone(),
            });
            shared.emit(ConversationEvent::ReplyStarted {
                message_id: placeholder_id,
            });
            (operation, inner.store_generation, history, user_message, cancel)
        };

        tracing::debug!(operation, history = history.len(), "reply requested");
        Some(tokio::spawn(run_reply(
            shared,
            operation,
            generation,
            history,
            user_message,
            cancel,
        )))
    }

    /// Cancel the reply in flight and drop its placeholder.
    ///
    /// Returns `false` (and changes nothing) when no reply is outstanding.
    pub fn stop_requesting(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        let stopped = self.shared.cancel_active(&mut inner);
        if stopped {
            self.shared.publish(&inner);
        }
        stopped
    }

    /// Cancel any reply in flight, remove every message and clear the store.
    ///
    /// The in-memory clear is applied before the store is asked to clear; a
    /// store failure only sets `last_error`. Saves already in progress finish
    /// before the store is cleared; saves not yet started are dropped.
    pub async fn clear(&self) {
        {
            let mut inner = self.shared.inner.lock();
            self.shared.cancel_active(&mut inner);
            inner.store_generation += 1;
            inner.state.messages.clear();
            inner.state.current_input.clear();
            inner.state.last_error = None;
            self.shared.publish(&inner);
            self.shared.emit(ConversationEvent::Cleared);
        }

        let cleared = {
            let _guard = self.shared.store_lock.lock().await;
            self.shared.store.clear_all().await
        };
        if let Err(e) = cleared {
            self.shared.record_error(Error::Storage(e));
        }
    }
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.state.clone());
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Deactivate the reply in flight, cancel it and remove its placeholder.
    /// The caller publishes.
    fn cancel_active(&self, inner: &mut Inner) -> bool {
        let Some(active) = inner.active.take() else {
            return false;
        };
        active.cancel.cancel();
        inner.state.remove_message(active.message_id);
        inner.state.awaiting_reply = false;
        tracing::debug!(operation = active.operation, "reply cancelled");
        self.emit(ConversationEvent::ReplyCancelled {
            message_id: active.message_id,
        });
        true
    }

    /// Append `delta` to the pending reply of `operation`.
    /// Returns `false` once the operation is no longer active. A reply whose
    /// placeholder has disappeared is ended as cancelled.
    fn apply_fragment(&self, operation: u64, delta: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(message_id) = inner
            .active
            .as_ref()
            .filter(|a| a.operation == operation)
            .map(|a| a.message_id)
        else {
            return false;
        };
        match inner.state.message_mut(message_id) {
            Some(message) => message.text.push_str(delta),
            None => {
                self.cancel_active(&mut inner);
                self.publish(&inner);
                return false;
            }
        }
        self.publish(&inner);
        self.emit(ConversationEvent::Fragment {
            message_id,
            delta: delta.to_string(),
        });
        true
    }

    /// Finalize the pending reply of `operation`, returning the finished message.
    fn finish(&self, operation: u64) -> Option<Message> {
        let mut inner = self.inner.lock();
        if !inner.is_active(operation) {
            return None;
        }
        let active = inner.active.take()?;
        inner.state.awaiting_reply = false;
        let message = inner.state.message_mut(active.message_id).map(|m| {
            m.pending = false;
            m.clone()
        });
        self.publish(&inner);
        match message {
            Some(ref message) => self.emit(ConversationEvent::ReplyFinished {
                message: message.clone(),
            }),
            None => self.emit(ConversationEvent::ReplyCancelled {
                message_id: active.message_id,
            }),
        }
        message
    }

    /// Drop the pending reply of `operation` and record why.
    fn fail(&self, operation: u64, error: Error) {
        let mut inner = self.inner.lock();
        if !inner.is_active(operation) {
            return;
        }
        let Some(active) = inner.active.take() else {
            return;
        };
        let message = error.to_string();
        tracing::warn!(operation, "reply failed: {}", message);
        inner.state.remove_message(active.message_id);
        inner.state.awaiting_reply = false;
        inner.state.last_error = Some(message.clone());
        self.publish(&inner);
        self.emit(ConversationEvent::ReplyFailed {
            message_id: active.message_id,
            error: message,
        });
    }

    /// Save `message` unless a clear has run since `generation`.
    async fn persist(&self, message: &Message, generation: u64) {
        let saved = {
            let _guard = self.store_lock.lock().await;
            let current = self.inner.lock().store_generation;
            if current != generation {
                tracing::debug!(id = message.id, "skipping save of cleared message");
                return;
            }
            self.store.save(message).await
        };
        if let Err(e) = saved {
            self.record_error(Error::Storage(e));
        }
    }

    /// Record a failure that leaves messages untouched.
    fn record_error(&self, error: Error) {
        let message = error.to_string();
        tracing::warn!("{}", message);
        let mut inner = self.inner.lock();
        inner.state.last_error = Some(message.clone());
        self.publish(&inner);
        self.emit(ConversationEvent::Error { message });
    }
}

/// Stream one reply into the placeholder owned by `operation`.
async fn run_reply(
    shared: Arc<Shared>,
    operation: u64,
    generation: u64,
    history: Vec<Message>,
    user_message: Message,
    cancel: CancellationToken,
) {
    // The user message stays in the conversation even if the reply is stopped.
    shared.persist(&user_message, generation).await;
    if cancel.is_cancelled() {
        return;
    }

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = shared.transport.open_chat_stream(history) => opened,
    };
    let body = match opened {
        Ok(body) => body,
        Err(e) => {
            shared.fail(operation, Error::Transport(e));
            return;
        }
    };

    let mut events = Box::pin(StreamDecoder::new(body).decode(cancel));
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Fragment(delta) => {
                if !shared.apply_fragment(operation, &delta) {
                    return;
                }
            }
            StreamEvent::Done => break,
            StreamEvent::DecodeError(e) if e.is_terminal() => {
                shared.fail(operation, Error::Stream(e));
                return;
            }
            StreamEvent::DecodeError(_) => {}
        }
    }
    drop(events);

    let Some(message) = shared.finish(operation) else {
        return;
    };
    tracing::debug!(operation, chars = message.text.len(), "reply finished");
    shared.persist(&message, generation).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StorageError};
    use async_trait::async_trait;
    use feishu_ai::{ByteStream, Origin};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::{Notify, Semaphore};

    enum Script {
        Body(Vec<u8>),
        Pipe(DuplexStream),
        Fail(u16),
    }

    /// Transport that replays scripted responses in order. Once the script
    /// runs out it answers with a body that never ends.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<Vec<Message>>>,
        held: Mutex<Vec<DuplexStream>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_chat_stream(&self, history: Vec<Message>) -> feishu_ai::Result<ByteStream> {
            self.requests.lock().push(history);
            let next = self.script.lock().pop_front();
            match next {
                Some(Script::Body(bytes)) => Ok(Box::pin(io::Cursor::new(bytes))),
                Some(Script::Pipe(reader)) => Ok(Box::pin(BufReader::new(reader))),
                Some(Script::Fail(status)) => Err(feishu_ai::Error::api(status, "scripted failure")),
                None => {
                    let (reader, writer) = tokio::io::duplex(64);
                    self.held.lock().push(writer);
                    Ok(Box::pin(BufReader::new(reader)))
                }
            }
        }
    }

    /// Store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn save(&self, _message: &Message) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".into()))
        }

        async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
            Err(StorageError::Unavailable("disk full".into()))
        }

        async fn clear_all(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".into()))
        }
    }

    /// Memory store whose loads and assistant saves can be held until the
    /// test releases them.
    struct GatedStore {
        inner: MemoryStore,
        hold_loads: AtomicBool,
        hold_replies: AtomicBool,
        reached: Notify,
        release: Semaphore,
    }

    impl GatedStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                hold_loads: AtomicBool::new(false),
                hold_replies: AtomicBool::new(false),
                reached: Notify::new(),
                release: Semaphore::new(0),
            })
        }

        async fn hold(&self) {
            self.reached.notify_one();
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    #[async_trait]
    impl MessageStore for GatedStore {
        async fn save(&self, message: &Message) -> Result<(), StorageError> {
            if !message.is_user() && self.hold_replies.load(Ordering::SeqCst) {
                self.hold().await;
            }
            self.inner.save(message).await
        }

        async fn load_all(&self) -> Result<Vec<Message>, StorageError> {
            if self.hold_loads.load(Ordering::SeqCst) {
                self.hold().await;
            }
            self.inner.load_all().await
        }

        async fn clear_all(&self) -> Result<(), StorageError> {
            self.inner.clear_all().await
        }
    }

    fn texts(state: &ConversationState) -> Vec<&str> {
        state.messages.iter().map(|m| m.text.as_str()).collect()
    }

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    fn controller(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> ConversationController {
        ConversationController::new(transport, store)
    }

    async fn wait_until(
        controller: &ConversationController,
        mut predicate: impl FnMut(&ConversationState) -> bool,
    ) {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for state")
            .expect("controller dropped");
    }

    fn pending_text(state: &ConversationState) -> Option<&str> {
        state.pending_message().map(|m| m.text.as_str())
    }

    #[tokio::test]
    async fn test_send_message_streams_reply_to_completion() {
        let (reader, mut writer) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Script::Pipe(reader)]);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(transport.clone(), store.clone());

        let task = controller.send_message("hello").unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].origin, Origin::User);
        assert_eq!(state.messages[0].text, "hello");
        assert_eq!(state.messages[1].origin, Origin::Assistant);
        assert_eq!(state.messages[1].text, "");
        assert!(state.messages[1].pending);
        assert!(state.awaiting_reply);
        assert!(state.last_error.is_none());

        writer.write_all(chunk("Hi").as_bytes()).await.unwrap();
        wait_until(&controller, |s| pending_text(s) == Some("Hi")).await;

        writer.write_all(chunk("!").as_bytes()).await.unwrap();
        writer.write_all(b"data: [DONE]\n\n").await.unwrap();
        task.await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].text, "hello");
        assert_eq!(state.messages[1].text, "Hi!");
        assert!(!state.messages[1].pending);
        assert!(!state.awaiting_reply);
        assert!(state.last_error.is_none());

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.requests()[0], vec![state.messages[0].clone()]);
        assert_eq!(store.messages(), state.messages);
    }

    #[tokio::test]
    async fn test_natural_end_without_done_finalizes() {
        let body = format!("{}{}", chunk("par"), chunk("tial"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        controller.send_message("hi").unwrap().await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages[1].text, "partial");
        assert!(!state.messages[1].pending);
        assert!(!state.awaiting_reply);
    }

    #[tokio::test]
    async fn test_transport_failure_removes_placeholder() {
        let transport = ScriptedTransport::new(vec![Script::Fail(500)]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        controller.send_message("hello").unwrap().await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text, "hello");
        assert!(state.messages[0].is_user());
        assert!(!state.awaiting_reply);
        let error = state.last_error.expect("error recorded");
        assert!(error.starts_with("request failed"), "got: {}", error);
    }

    #[tokio::test]
    async fn test_terminal_stream_error_removes_placeholder() {
        let mut body = chunk("partial").into_bytes();
        body.extend_from_slice(b"data: \xff\xfe\n");
        let transport = ScriptedTransport::new(vec![Script::Body(body)]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        controller.send_message("hello").unwrap().await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 1);
        assert!(!state.awaiting_reply);
        let error = state.last_error.expect("error recorded");
        assert!(error.starts_with("reply interrupted"), "got: {}", error);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_fail_reply() {
        let body = format!("{}data: {{oops\n\n{}data: [DONE]\n", chunk("a"), chunk("b"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        controller.send_message("hello").unwrap().await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages[1].text, "ab");
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let transport = ScriptedTransport::new(vec![]);
        let controller = controller(transport.clone(), Arc::new(MemoryStore::new()));
        controller.update_input("draft");

        assert!(controller.send_message("").is_none());
        assert!(controller.send_message("  \n\t ").is_none());

        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(!state.awaiting_reply);
        assert_eq!(state.current_input, "draft");
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_send_clears_input_and_previous_error() {
        let transport = ScriptedTransport::new(vec![Script::Fail(400), Script::Body(b"data: [DONE]\n".to_vec())]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        controller.send_message("first").unwrap().await.unwrap();
        assert!(controller.state().last_error.is_some());

        controller.update_input("second");
        let task = controller.send_message("second").unwrap();
        let state = controller.state();
        assert!(state.last_error.is_none());
        assert!(state.current_input.is_empty());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_requesting_removes_placeholder_and_releases_body() {
        let (reader, mut writer) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Script::Pipe(reader)]);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(transport, store.clone());

        let task = controller.send_message("hello").unwrap();
        writer.write_all(chunk("Hi").as_bytes()).await.unwrap();
        wait_until(&controller, |s| pending_text(s) == Some("Hi")).await;

        assert!(controller.stop_requesting());

        let state = controller.state();
        assert_eq!(state.messages.len(), 1);
        assert!(state.messages[0].is_user());
        assert!(!state.awaiting_reply);
        assert!(state.last_error.is_none());

        task.await.unwrap();
        let err = writer.write_all(chunk("late").as_bytes()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(controller.state(), state);
        // Only the user message was persisted.
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_any_fragment() {
        let transport = ScriptedTransport::new(vec![]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        let task = controller.send_message("hello").unwrap();
        assert!(controller.stop_requesting());
        task.await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 1);
        assert!(!state.awaiting_reply);
        assert_eq!(state.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let transport = ScriptedTransport::new(vec![Script::Body(b"data: [DONE]\n".to_vec())]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));
        controller.send_message("hello").unwrap().await.unwrap();

        let before = controller.state();
        assert!(!controller.stop_requesting());
        assert!(!controller.stop_requesting());
        assert_eq!(controller.state(), before);
    }

    #[tokio::test]
    async fn test_clear_twice_is_safe() {
        let body = format!("{}data: [DONE]\n", chunk("Hi"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(transport, store.clone());
        controller.send_message("hello").unwrap().await.unwrap();
        assert_eq!(store.messages().len(), 2);

        controller.clear().await;
        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(state.last_error.is_none());

        controller.clear().await;
        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(state.last_error.is_none());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_clear_cancels_reply_in_flight() {
        let (reader, mut writer) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Script::Pipe(reader)]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        let task = controller.send_message("hello").unwrap();
        writer.write_all(chunk("Hi").as_bytes()).await.unwrap();
        wait_until(&controller, |s| pending_text(s) == Some("Hi")).await;

        controller.clear().await;
        task.await.unwrap();

        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(!state.awaiting_reply);
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn test_clear_store_failure_keeps_memory_cleared() {
        let transport = ScriptedTransport::new(vec![Script::Body(b"data: [DONE]\n".to_vec())]);
        let controller = ConversationController::new(transport, Arc::new(BrokenStore));
        controller.send_message("hello").unwrap().await.unwrap();

        controller.clear().await;

        let state = controller.state();
        assert!(state.messages.is_empty());
        let error = state.last_error.expect("storage error surfaced");
        assert!(error.contains("disk full"), "got: {}", error);
    }

    #[tokio::test]
    async fn test_save_failure_does_not_roll_back_reply() {
        let body = format!("{}data: [DONE]\n", chunk("Hi"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let controller = ConversationController::new(transport, Arc::new(BrokenStore));

        controller.send_message("hello").unwrap().await.unwrap();

        let state = controller.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].text, "Hi");
        assert!(!state.messages[1].pending);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_new_send_supersedes_reply_in_flight() {
        let (first_reader, mut first_writer) = tokio::io::duplex(1024);
        let (second_reader, mut second_writer) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![
            Script::Pipe(first_reader),
            Script::Pipe(second_reader),
        ]);
        let controller = controller(transport.clone(), Arc::new(MemoryStore::new()));

        let first = controller.send_message("a").unwrap();
        first_writer.write_all(chunk("A").as_bytes()).await.unwrap();
        wait_until(&controller, |s| pending_text(s) == Some("A")).await;

        let second = controller.send_message("b").unwrap();
        let state = controller.state();
        assert_eq!(state.pending_count(), 1);
        let texts: Vec<_> = state.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", ""]);

        first.await.unwrap();
        assert!(first_writer.write_all(chunk("late").as_bytes()).await.is_err());

        second_writer.write_all(chunk("B").as_bytes()).await.unwrap();
        second_writer.write_all(b"data: [DONE]\n").await.unwrap();
        second.await.unwrap();

        let state = controller.state();
        let texts: Vec<_> = state.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "B"]);
        assert_eq!(state.pending_count(), 0);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let second_history: Vec<_> = requests[1].iter().map(|m| m.text.as_str()).collect();
        assert_eq!(second_history, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_at_most_one_pending_across_operations() {
        let transport = ScriptedTransport::new(vec![]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        for step in 0..30u32 {
            match (step * 7 + 3) % 5 {
                0 | 1 | 2 => {
                    controller.send_message(&format!("message {step}"));
                }
                3 => {
                    controller.stop_requesting();
                }
                _ => controller.clear().await,
            }
            tokio::task::yield_now().await;
            let state = controller.state();
            assert!(state.pending_count() <= 1, "step {step}: {:?}", state);
            assert_eq!(state.awaiting_reply, state.pending_count() == 1);
        }
    }

    #[tokio::test]
    async fn test_events_follow_reply_lifecycle() {
        let body = format!("{}{}data: [DONE]\n", chunk("Hi"), chunk("!"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));
        let mut events = controller.events();

        controller.send_message("hello").unwrap().await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 5);
        assert!(matches!(received[0], ConversationEvent::MessageAppended { .. }));
        assert_eq!(received[1], ConversationEvent::ReplyStarted { message_id: 2 });
        assert_eq!(
            received[2],
            ConversationEvent::Fragment {
                message_id: 2,
                delta: "Hi".into()
            }
        );
        assert_eq!(
            received[3],
            ConversationEvent::Fragment {
                message_id: 2,
                delta: "!".into()
            }
        );
        match &received[4] {
            ConversationEvent::ReplyFinished { message } => assert_eq!(message.text, "Hi!"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_loads_history_and_continues_ids() {
        let store = Arc::new(MemoryStore::with_messages(vec![
            Message::user(1, "earlier"),
            Message::assistant(2, "reply"),
        ]));
        let transport = ScriptedTransport::new(vec![Script::Body(b"data: [DONE]\n".to_vec())]);
        let controller = controller(transport.clone(), store);

        controller.initialize().await;
        let state = controller.state();
        assert!(state.is_initialized);
        assert!(!state.is_loading);
        assert_eq!(state.messages.len(), 2);

        controller.send_message("again").unwrap().await.unwrap();
        let state = controller.state();
        let ids: Vec<_> = state.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(transport.requests()[0].len(), 3);
    }

    #[tokio::test]
    async fn test_initialize_failure_reports_error() {
        let transport = ScriptedTransport::new(vec![]);
        let controller = ConversationController::new(transport, Arc::new(BrokenStore));

        controller.initialize().await;

        let state = controller.state();
        assert!(state.is_initialized);
        assert!(!state.is_loading);
        let error = state.last_error.expect("load error");
        assert!(error.starts_with("load failed"), "got: {}", error);
    }

    #[tokio::test]
    async fn test_reload_replaces_messages_from_store() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![]);
        let controller = controller(transport, store.clone());
        controller.initialize().await;
        assert!(controller.state().messages.is_empty());

        store.save(&Message::user(10, "from elsewhere")).await.unwrap();
        controller.reload().await;

        let state = controller.state();
        assert!(state.is_initialized);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text, "from elsewhere");
    }

    #[tokio::test]
    async fn test_wait_for_idle_returns_after_reply() {
        let (reader, mut writer) = tokio::io::duplex(1024);
        let transport = ScriptedTransport::new(vec![Script::Pipe(reader)]);
        let controller = controller(transport, Arc::new(MemoryStore::new()));

        let _task = controller.send_message("hello").unwrap();
        assert!(controller.is_busy());

        writer.write_all(b"data: [DONE]\n").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), controller.wait_for_idle())
            .await
            .expect("idle");
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn test_clear_during_reply_save_leaves_store_empty() {
        let body = format!("{}data: [DONE]\n", chunk("Hi"));
        let transport = ScriptedTransport::new(vec![Script::Body(body.into_bytes())]);
        let store = GatedStore::new();
        store.hold_replies.store(true, Ordering::SeqCst);
        let controller = ConversationController::new(transport, store.clone());

        let task = controller.send_message("hello").unwrap();
        store.reached.notified().await;

        // A slow save does not hold back the finalized reply.
        let state = controller.state();
        assert!(!state.awaiting_reply);
        assert_eq!(texts(&state), vec!["hello", "Hi"]);
        assert!(!state.messages[1].pending);

        let clearing = tokio::spawn({
            let controller = controller.clone();
            async move { controller.clear().await }
        });
        wait_until(&controller, |s| s.messages.is_empty()).await;

        store.release.add_permits(1);
        task.await.unwrap();
        clearing.await.unwrap();

        assert!(store.inner.messages().is_empty());
        controller.reload().await;
        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_send_while_loading_is_refused() {
        let store = GatedStore::new();
        store.inner.save(&Message::user(1, "earlier")).await.unwrap();
        store.hold_loads.store(true, Ordering::SeqCst);
        let transport = ScriptedTransport::new(vec![Script::Body(b"data: [DONE]\n".to_vec())]);
        let controller = ConversationController::new(transport.clone(), store.clone());

        let loading = tokio::spawn({
            let controller = controller.clone();
            async move { controller.initialize().await }
        });
        store.reached.notified().await;
        assert!(controller.state().is_loading);

        assert!(controller.send_message("hello").is_none());
        assert!(!controller.state().awaiting_reply);

        store.release.add_permits(1);
        loading.await.unwrap();

        let state = controller.state();
        assert_eq!(texts(&state), vec!["earlier"]);
        assert!(!state.awaiting_reply);
        assert!(!controller.is_busy());
        assert!(transport.requests().is_empty());

        controller.send_message("hello").unwrap().await.unwrap();
        let state = controller.state();
        let ids: Vec<_> = state.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!state.awaiting_reply);
    }

    #[tokio::test]
    async fn test_stopped_sends_still_persist_user_messages() {
        let transport = ScriptedTransport::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(transport, store.clone());

        let first = controller.send_message("a").unwrap();
        let second = controller.send_message("b").unwrap();
        assert!(controller.stop_requesting());
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(texts(&controller.state()), vec!["a", "b"]);
        controller.reload().await;
        assert_eq!(texts(&controller.state()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cleared_send_does_not_persist_user_message() {
        let transport = ScriptedTransport::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(transport, store.clone());

        let task = controller.send_message("gone").unwrap();
        controller.clear().await;
        task.await.unwrap();

        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_orders_history_by_id() {
        let store = Arc::new(MemoryStore::with_messages(vec![
            Message::assistant(2, "reply"),
            Message::user(1, "question"),
        ]));
        let controller = controller(ScriptedTransport::new(vec![]), store);

        controller.initialize().await;

        assert_eq!(texts(&controller.state()), vec!["question", "reply"]);
    }
}
