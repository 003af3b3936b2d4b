use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::markdown::render_markdown;
use super::store::ChatStore;
use crate::config::ClientConfig;
use crate::models::conversation::{truncate_title, DEFAULT_TITLE};
use crate::models::{Conversation, ConversationPatch, Message, Role};
use crate::relay::{RelayReply, RelayRequest};
use crate::stream::{DecodedEvent, StreamDecoder};

pub const NETWORK_ERROR_REPLY: &str = "Maaf, tidak dapat terhubung ke server. Silakan coba lagi.";
pub const SERVICE_ERROR_REPLY: &str = "Maaf, terjadi kesalahan. Silakan coba lagi.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Relay returned HTTP {status}: {body}")]
    Relay { status: u16, body: String },

    #[error("No data from relay for {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Nothing to regenerate")]
    NothingToRegenerate,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ChatError {
    /// Text shown in place of the reply. `None` for cancellation.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            ChatError::Cancelled => None,
            ChatError::Network(_) | ChatError::Timeout(_) => Some(NETWORK_ERROR_REPLY),
            _ => Some(SERVICE_ERROR_REPLY),
        }
    }
}

/// Relay response body, chunked however the network delivers it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Resolves once response headers arrive. A non-success status is
    /// reported as `ChatError::Relay`.
    async fn open_stream(&self, request: &RelayRequest) -> Result<ByteStream, ChatError>;

    async fn complete(&self, request: &RelayRequest) -> Result<RelayReply, ChatError>;
}

/// Render sink driven by the controller.
pub trait ChatView: Send + Sync {
    fn show_message(&self, message: &Message);
    fn begin_assistant(&self);
    /// Called with the whole reply so far, never just the newest fragment.
    fn update_assistant(&self, text: &str, html: &str);
    fn finish_assistant(&self, text: &str);
    fn fail_assistant(&self, message: &str);
    fn remove_last_assistant(&self);
    fn clear(&self);
    fn show_history(&self, conversations: &[Conversation]);
}

impl<V: ChatView + ?Sized> ChatView for Arc<V> {
    fn show_message(&self, message: &Message) {
        (**self).show_message(message)
    }

    fn begin_assistant(&self) {
        (**self).begin_assistant()
    }

    fn update_assistant(&self, text: &str, html: &str) {
        (**self).update_assistant(text, html)
    }

    fn finish_assistant(&self, text: &str) {
        (**self).finish_assistant(text)
    }

    fn fail_assistant(&self, message: &str) {
        (**self).fail_assistant(message)
    }

    fn remove_last_assistant(&self) {
        (**self).remove_last_assistant()
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn show_history(&self, conversations: &[Conversation]) {
        (**self).show_history(conversations)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    AwaitingFirstByte,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The assembled reply, now the last message of the conversation.
    Completed(String),
    Cancelled,
    /// The user-facing error text that replaced the reply.
    Failed(String),
}

struct ActiveSession {
    id: u64,
    token: CancellationToken,
}

struct SessionState {
    conversation: Option<Conversation>,
    phase: StreamPhase,
    active: Option<ActiveSession>,
    next_session: u64,
}

impl SessionState {
    fn is_current(&self, session: u64) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == session)
    }

    fn cancel_active(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Drives one chat exchange at a time against the relay.
pub struct ChatController<T, S, V> {
    transport: T,
    store: S,
    view: V,
    stream_responses: bool,
    idle_timeout: Duration,
    history_limit: usize,
    state: Mutex<SessionState>,
}

impl<T, S, V> ChatController<T, S, V>
where
    T: RelayTransport,
    S: ChatStore,
    V: ChatView,
{
    pub fn new(transport: T, store: S, view: V, config: &ClientConfig) -> Self {
        Self {
            transport,
            store,
            view,
            stream_responses: config.stream_responses,
            idle_timeout: config.idle_timeout(),
            history_limit: config.history_limit,
            state: Mutex::new(SessionState {
                conversation: None,
                phase: StreamPhase::Idle,
                active: None,
                next_session: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> StreamPhase {
        self.state().phase
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        self.state().conversation.clone()
    }

    /// Append a user turn and stream the reply to it.
    pub async fn send(&self, text: &str) -> Result<StreamOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = Message::user(text);
        let (session, token, request) = {
            let mut state = self.state();
            let conversation = state.conversation.get_or_insert_with(Conversation::new);
            conversation.push(message.clone());
            let request = RelayRequest::for_conversation(conversation, self.stream_responses);
            let (session, token) = self.begin_session(&mut state);
            (session, token, request)
        };

        self.view.show_message(&message);
        Ok(self.exchange(session, token, request).await)
    }

    /// Drop the last reply and ask again with the same trailing user turn.
    pub async fn regenerate(&self) -> Result<StreamOutcome, ChatError> {
        let (session, token, request, removed) = {
            let mut state = self.state();
            let conversation = state
                .conversation
                .as_ref()
                .ok_or(ChatError::NothingToRegenerate)?;

            let mut candidate = conversation.clone();
            let removed = candidate.pop_last_assistant().is_some();
            if candidate.last_role() != Some(Role::User) {
                return Err(ChatError::NothingToRegenerate);
            }

            let request = RelayRequest::for_conversation(&candidate, self.stream_responses);
            state.conversation = Some(candidate);
            let (session, token) = self.begin_session(&mut state);
            (session, token, request, removed)
        };

        if removed {
            self.view.remove_last_assistant();
        }
        Ok(self.exchange(session, token, request).await)
    }

    /// Abort the in-flight reply, if any.
    pub fn cancel(&self) {
        let mut state = self.state();
        if state.cancel_active() {
            state.phase = StreamPhase::Cancelled;
        }
    }

    pub fn new_chat(&self) {
        {
            let mut state = self.state();
            state.phase = if state.cancel_active() {
                StreamPhase::Cancelled
            } else {
                StreamPhase::Idle
            };
            state.conversation = None;
        }
        self.view.clear();
    }

    pub fn open_chat(&self, conversation: Conversation) {
        {
            let mut state = self.state();
            state.phase = if state.cancel_active() {
                StreamPhase::Cancelled
            } else {
                StreamPhase::Idle
            };
            state.conversation = Some(conversation.clone());
        }
        self.view.clear();
        for message in &conversation.messages {
            self.view.show_message(message);
        }
    }

    /// Reload saved conversations. A failed load shows an empty list.
    pub async fn refresh_history(&self) -> Vec<Conversation> {
        let conversations = match self.store.list(self.history_limit).await {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::error!("Failed to load chat history: {:#}", e);
                Vec::new()
            }
        };
        self.view.show_history(&conversations);
        conversations
    }

    pub async fn rename_chat(&self, id: &str, title: &str) -> Vec<Conversation> {
        let title = truncate_title(title.trim());
        if !title.is_empty() {
            {
                let mut state = self.state();
                if let Some(conversation) = state.conversation.as_mut().filter(|c| c.id == id) {
                    conversation.title = title.clone();
                }
            }
            if let Err(e) = self.store.update(id, ConversationPatch::title(title)).await {
                tracing::error!("Failed to rename chat {}: {:#}", id, e);
            }
        }
        self.refresh_history().await
    }

    pub async fn delete_chat(&self, id: &str) -> Vec<Conversation> {
        if let Err(e) = self.store.delete(id).await {
            tracing::error!("Failed to delete chat {}: {:#}", id, e);
        }
        let is_open = self
            .state()
            .conversation
            .as_ref()
            .is_some_and(|c| c.id == id);
        if is_open {
            self.new_chat();
        }
        self.refresh_history().await
    }

    fn begin_session(&self, state: &mut SessionState) -> (u64, CancellationToken) {
        state.cancel_active();
        state.next_session += 1;
        let session = state.next_session;
        let token = CancellationToken::new();
        state.active = Some(ActiveSession {
            id: session,
            token: token.clone(),
        });
        state.phase = StreamPhase::AwaitingFirstByte;
        (session, token)
    }

    async fn exchange(
        &self,
        session: u64,
        token: CancellationToken,
        request: RelayRequest,
    ) -> StreamOutcome {
        self.view.begin_assistant();
        tracing::debug!(
            "Sending {} messages to relay (stream: {})",
            request.messages.len(),
            request.stream
        );

        let result = if request.stream {
            self.stream_reply(session, &token, &request).await
        } else {
            self.complete_reply(session, &token, &request).await
        };

        self.settle(session, &token, result).await
    }

    async fn stream_reply(
        &self,
        session: u64,
        token: &CancellationToken,
        request: &RelayRequest,
    ) -> Result<String, ChatError> {
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            opened = timeout(self.idle_timeout, self.transport.open_stream(request)) => {
                opened.map_err(|_| ChatError::Timeout(self.idle_timeout))??
            }
        };
        self.set_phase(session, StreamPhase::Streaming);

        let mut decoder = StreamDecoder::new();
        let mut accumulated = String::new();

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(ChatError::Cancelled),
                next = timeout(self.idle_timeout, stream.next()) => {
                    next.map_err(|_| ChatError::Timeout(self.idle_timeout))?
                }
            };

            let ended = next.is_none();
            let events = match next {
                Some(chunk) => decoder.feed(&chunk?),
                None => decoder.finish(),
            };
            for event in events {
                match event {
                    DecodedEvent::Fragment(fragment) => {
                        accumulated.push_str(&fragment);
                        self.render(session, &accumulated);
                    }
                    DecodedEvent::Done => return Ok(accumulated),
                }
            }

            // The relay aborts the body on failure, so an end without the
            // sentinel means the reply was cut short.
            if ended {
                return Err(ChatError::InvalidResponse(
                    "Stream ended before completion".to_string(),
                ));
            }
        }
    }

    async fn complete_reply(
        &self,
        session: u64,
        token: &CancellationToken,
        request: &RelayRequest,
    ) -> Result<String, ChatError> {
        let reply = tokio::select! {
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            reply = timeout(self.idle_timeout, self.transport.complete(request)) => {
                reply.map_err(|_| ChatError::Timeout(self.idle_timeout))??
            }
        };
        self.render(session, &reply.reply);
        Ok(reply.reply)
    }

    fn render(&self, session: u64, text: &str) {
        let html = render_markdown(text);
        // Held through the update so a superseding session cannot interleave.
        let state = self.state();
        if state.is_current(session) {
            self.view.update_assistant(text, &html);
        }
    }

    fn set_phase(&self, session: u64, phase: StreamPhase) {
        let mut state = self.state();
        if state.is_current(session) {
            state.phase = phase;
        }
    }

    async fn settle(
        &self,
        session: u64,
        token: &CancellationToken,
        result: Result<String, ChatError>,
    ) -> StreamOutcome {
        let saved = {
            let mut state = self.state();
            if !state.is_current(session) || token.is_cancelled() {
                tracing::debug!("Reply cancelled");
                return StreamOutcome::Cancelled;
            }
            state.active = None;

            match result {
                Ok(text) if !text.trim().is_empty() => {
                    state.phase = StreamPhase::Completed;
                    let conversation = state.conversation.get_or_insert_with(Conversation::new);
                    conversation.push(Message::assistant(text.clone()));
                    if conversation.title == DEFAULT_TITLE {
                        conversation.title = conversation.derive_title();
                    }
                    Ok((text, conversation.clone()))
                }
                Ok(_) => {
                    state.phase = StreamPhase::Failed;
                    Err(ChatError::InvalidResponse("Empty reply".to_string()))
                }
                Err(ChatError::Cancelled) => {
                    state.phase = StreamPhase::Cancelled;
                    return StreamOutcome::Cancelled;
                }
                Err(e) => {
                    state.phase = StreamPhase::Failed;
                    Err(e)
                }
            }
        };

        match saved {
            Ok((text, conversation)) => {
                self.view.finish_assistant(&text);
                if let Err(e) = self.store.upsert(&conversation).await {
                    tracing::error!("Failed to save chat {}: {:#}", conversation.id, e);
                }
                self.refresh_history().await;
                StreamOutcome::Completed(text)
            }
            Err(e) => {
                tracing::error!("Chat request failed: {}", e);
                let message = e.user_message().unwrap_or(SERVICE_ERROR_REPLY);
                self.view.fail_assistant(message);
                StreamOutcome::Failed(message.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::bail;

    use super::*;
    use crate::services::database::Database;

    enum Script {
        Stream { chunks: Vec<&'static str>, hang: bool },
        Reply(&'static str),
        Fail(ChatError),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<RelayRequest>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::default(),
            })
        }

        fn next(&self, request: &RelayRequest) -> Script {
            self.requests.lock().unwrap().push(request.clone());
            self.scripts.lock().unwrap().pop_front().expect("unexpected request")
        }
    }

    #[async_trait]
    impl RelayTransport for Arc<ScriptedTransport> {
        async fn open_stream(&self, request: &RelayRequest) -> Result<ByteStream, ChatError> {
            match self.next(request) {
                Script::Stream { chunks, hang } => {
                    let body = futures::stream::iter(
                        chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
                    );
                    if hang {
                        Ok(body.chain(futures::stream::pending()).boxed())
                    } else {
                        Ok(body.boxed())
                    }
                }
                Script::Fail(e) => Err(e),
                Script::Reply(_) => panic!("expected a streaming request"),
            }
        }

        async fn complete(&self, request: &RelayRequest) -> Result<RelayReply, ChatError> {
            match self.next(request) {
                Script::Reply(reply) => Ok(RelayReply {
                    reply: reply.to_string(),
                    chat_id: request.chat_id.clone(),
                }),
                Script::Fail(e) => Err(e),
                Script::Stream { .. } => panic!("expected a non-streaming request"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum ViewEvent {
        Message(Role, String),
        Begin,
        Update(String),
        Finish(String),
        Fail(String),
        RemoveLast,
        Clear,
        History(usize),
    }

    #[derive(Default)]
    struct RecordingView {
        events: Mutex<Vec<ViewEvent>>,
    }

    impl RecordingView {
        fn push(&self, event: ViewEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<ViewEvent> {
            self.events.lock().unwrap().clone()
        }

        fn updates(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ViewEvent::Update(text) => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    impl ChatView for RecordingView {
        fn show_message(&self, message: &Message) {
            self.push(ViewEvent::Message(message.role, message.content.clone()));
        }

        fn begin_assistant(&self) {
            self.push(ViewEvent::Begin);
        }

        fn update_assistant(&self, text: &str, html: &str) {
            assert!(html.starts_with("<p>"));
            self.push(ViewEvent::Update(text.to_string()));
        }

        fn finish_assistant(&self, text: &str) {
            self.push(ViewEvent::Finish(text.to_string()));
        }

        fn fail_assistant(&self, message: &str) {
            self.push(ViewEvent::Fail(message.to_string()));
        }

        fn remove_last_assistant(&self) {
            self.push(ViewEvent::RemoveLast);
        }

        fn clear(&self) {
            self.push(ViewEvent::Clear);
        }

        fn show_history(&self, conversations: &[Conversation]) {
            self.push(ViewEvent::History(conversations.len()));
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ChatStore for FailingStore {
        async fn upsert(&self, _conversation: &Conversation) -> anyhow::Result<()> {
            bail!("store offline")
        }

        async fn get(&self, _id: &str) -> anyhow::Result<Option<Conversation>> {
            bail!("store offline")
        }

        async fn list(&self, _limit: usize) -> anyhow::Result<Vec<Conversation>> {
            bail!("store offline")
        }

        async fn update(&self, _id: &str, _patch: ConversationPatch) -> anyhow::Result<()> {
            bail!("store offline")
        }

        async fn delete(&self, _id: &str) -> anyhow::Result<()> {
            bail!("store offline")
        }
    }

    type TestController<S> = ChatController<Arc<ScriptedTransport>, S, Arc<RecordingView>>;

    fn controller<S: ChatStore>(
        scripts: Vec<Script>,
        store: S,
        stream_responses: bool,
    ) -> (Arc<TestController<S>>, Arc<ScriptedTransport>, Arc<RecordingView>) {
        let config = ClientConfig {
            stream_responses,
            ..ClientConfig::default()
        };
        controller_with(scripts, store, &config)
    }

    fn controller_with<S: ChatStore>(
        scripts: Vec<Script>,
        store: S,
        config: &ClientConfig,
    ) -> (Arc<TestController<S>>, Arc<ScriptedTransport>, Arc<RecordingView>) {
        let transport = ScriptedTransport::new(scripts);
        let view = Arc::new(RecordingView::default());
        let controller = ChatController::new(transport.clone(), store, view.clone(), config);
        (Arc::new(controller), transport, view)
    }

    fn stream(chunks: Vec<&'static str>) -> Script {
        Script::Stream {
            chunks,
            hang: false,
        }
    }

    const HI_THERE: &[&str] = &[
        "data: {\"content\":\"Hi\"}\n\n",
        "data: {\"content\":\" there\"}\n\n",
        "data: {\"content\":\"!\"}\n\n",
        "data: [DONE]\n\n",
    ];

    #[tokio::test]
    async fn test_send_streams_and_persists() {
        let db = Database::new_in_memory().unwrap();
        let (controller, transport, view) =
            controller(vec![stream(HI_THERE.to_vec())], db.clone(), true);

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hi there!".to_string()));
        assert_eq!(controller.phase(), StreamPhase::Completed);

        assert_eq!(view.updates(), vec!["Hi", "Hi there", "Hi there!"]);
        let events = view.events();
        assert_eq!(events[0], ViewEvent::Message(Role::User, "Hello".to_string()));
        assert_eq!(events[1], ViewEvent::Begin);
        assert!(events.contains(&ViewEvent::Finish("Hi there!".to_string())));
        assert_eq!(events.last(), Some(&ViewEvent::History(1)));

        let request = &transport.requests.lock().unwrap()[0];
        assert!(request.stream);
        assert_eq!(request.messages, vec![Message::user("Hello")]);

        let saved = db.list(20).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].title, "Hello");
        assert_eq!(
            saved[0].messages,
            vec![Message::user("Hello"), Message::assistant("Hi there!")]
        );
    }

    #[tokio::test]
    async fn test_fragments_split_across_chunks() {
        let db = Database::new_in_memory().unwrap();
        let chunks = vec!["data: {\"con", "tent\":\"Hi\"}\n", "\ndata: [DO", "NE]\n\n"];
        let (controller, _, _) = controller(vec![stream(chunks)], db, true);

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hi".to_string()));
    }

    #[tokio::test]
    async fn test_regenerate_replaces_last_reply() {
        let db = Database::new_in_memory().unwrap();
        let (controller, transport, view) = controller(
            vec![
                stream(HI_THERE.to_vec()),
                stream(vec!["data: {\"content\":\"Hey!\"}\n\n", "data: [DONE]\n\n"]),
            ],
            db.clone(),
            true,
        );

        controller.send("Hello").await.unwrap();
        let outcome = controller.regenerate().await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hey!".to_string()));
        assert!(view.events().contains(&ViewEvent::RemoveLast));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[1].messages, vec![Message::user("Hello")]);

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(
            conversation.messages,
            vec![Message::user("Hello"), Message::assistant("Hey!")]
        );
        assert_eq!(db.list(20).await.unwrap()[0].messages, conversation.messages);
    }

    #[tokio::test]
    async fn test_regenerate_without_exchange_is_rejected() {
        let db = Database::new_in_memory().unwrap();
        let (controller, transport, _) = controller(Vec::new(), db, true);

        let err = controller.regenerate().await.unwrap_err();
        assert!(matches!(err, ChatError::NothingToRegenerate));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_chat_cancels_streaming_reply() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, view) = controller(
            vec![Script::Stream {
                chunks: vec!["data: {\"content\":\"Hi\"}\n\n"],
                hang: true,
            }],
            db.clone(),
            true,
        );

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send("Hello").await })
        };

        while view.updates().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(controller.phase(), StreamPhase::Streaming);

        controller.new_chat();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(controller.phase(), StreamPhase::Cancelled);
        assert!(controller.current_conversation().is_none());
        assert!(db.list(20).await.unwrap().is_empty());
        assert!(!view
            .events()
            .iter()
            .any(|e| matches!(e, ViewEvent::Fail(_) | ViewEvent::Finish(_))));
    }

    #[tokio::test]
    async fn test_new_send_supersedes_active_stream() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, view) = controller(
            vec![
                Script::Stream {
                    chunks: vec!["data: {\"content\":\"Hi\"}\n\n"],
                    hang: true,
                },
                stream(vec!["data: {\"content\":\"Second\"}\n\n", "data: [DONE]\n\n"]),
            ],
            db,
            true,
        );

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send("One").await })
        };
        while view.updates().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = controller.send("Two").await.unwrap();
        assert_eq!(second, StreamOutcome::Completed("Second".to_string()));
        assert_eq!(first.await.unwrap().unwrap(), StreamOutcome::Cancelled);

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(
            conversation.messages,
            vec![
                Message::user("One"),
                Message::user("Two"),
                Message::assistant("Second")
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_error_fails_without_saving() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, view) = controller(
            vec![Script::Fail(ChatError::Relay {
                status: 503,
                body: "rate limited".to_string(),
            })],
            db.clone(),
            true,
        );

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Failed(SERVICE_ERROR_REPLY.to_string()));
        assert_eq!(controller.phase(), StreamPhase::Failed);
        assert!(view
            .events()
            .contains(&ViewEvent::Fail(SERVICE_ERROR_REPLY.to_string())));

        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.last_role(), Some(Role::User));
        assert!(db.list(20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_uses_connection_message() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, _) = controller(
            vec![Script::Fail(ChatError::Network("refused".to_string()))],
            db,
            true,
        );

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Failed(NETWORK_ERROR_REPLY.to_string()));
    }

    #[tokio::test]
    async fn test_idle_stream_times_out_with_connection_message() {
        let db = Database::new_in_memory().unwrap();
        let config = ClientConfig {
            idle_timeout_secs: 1,
            ..ClientConfig::default()
        };
        let (controller, _, view) = controller_with(
            vec![Script::Stream {
                chunks: vec!["data: {\"content\":\"Hi\"}\n\n"],
                hang: true,
            }],
            db.clone(),
            &config,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(4), controller.send("Hello"))
            .await
            .expect("idle stream should time out")
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Failed(NETWORK_ERROR_REPLY.to_string()));
        assert_eq!(controller.phase(), StreamPhase::Failed);
        assert_eq!(view.updates(), vec!["Hi"]);
        assert!(view
            .events()
            .contains(&ViewEvent::Fail(NETWORK_ERROR_REPLY.to_string())));
        assert!(db.list(20).await.unwrap().is_empty());
    }

    type LockCheckingController = ChatController<Arc<ScriptedTransport>, Database, Arc<LockCheckingView>>;

    /// Reports whether the controller's session lock was free while an update was drawn.
    #[derive(Default)]
    struct LockCheckingView {
        controller: std::sync::OnceLock<std::sync::Weak<LockCheckingController>>,
        updates: std::sync::atomic::AtomicUsize,
        unlocked_updates: std::sync::atomic::AtomicUsize,
    }

    impl ChatView for LockCheckingView {
        fn show_message(&self, _message: &Message) {}
        fn begin_assistant(&self) {}

        fn update_assistant(&self, _text: &str, _html: &str) {
            use std::sync::atomic::Ordering;
            self.updates.fetch_add(1, Ordering::SeqCst);
            let controller = self.controller.get().and_then(std::sync::Weak::upgrade);
            if let Some(controller) = controller {
                if controller.state.try_lock().is_ok() {
                    self.unlocked_updates.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        fn finish_assistant(&self, _text: &str) {}
        fn fail_assistant(&self, _message: &str) {}
        fn remove_last_assistant(&self) {}
        fn clear(&self) {}
        fn show_history(&self, _conversations: &[Conversation]) {}
    }

    #[tokio::test]
    async fn test_updates_are_drawn_under_session_lock() {
        use std::sync::atomic::Ordering;

        let db = Database::new_in_memory().unwrap();
        let transport = ScriptedTransport::new(vec![stream(HI_THERE.to_vec())]);
        let view = Arc::new(LockCheckingView::default());
        let controller = Arc::new(ChatController::new(
            transport,
            db,
            view.clone(),
            &ClientConfig::default(),
        ));
        view.controller.set(Arc::downgrade(&controller)).unwrap();

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hi there!".to_string()));
        assert_eq!(view.updates.load(Ordering::SeqCst), 3);
        assert_eq!(view.unlocked_updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_cut_short_is_failure() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, _) = controller(
            vec![stream(vec!["data: {\"content\":\"Hi\"}\n\n"])],
            db.clone(),
            true,
        );

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Failed(SERVICE_ERROR_REPLY.to_string()));
        assert!(db.list(20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_reply() {
        let (controller, _, view) = controller(vec![stream(HI_THERE.to_vec())], FailingStore, true);

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hi there!".to_string()));
        assert_eq!(controller.current_conversation().unwrap().messages.len(), 2);
        assert_eq!(view.events().last(), Some(&ViewEvent::History(0)));
    }

    #[tokio::test]
    async fn test_non_streaming_reply() {
        let db = Database::new_in_memory().unwrap();
        let (controller, transport, view) =
            controller(vec![Script::Reply("Hi there!")], db.clone(), false);

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed("Hi there!".to_string()));
        assert_eq!(view.updates(), vec!["Hi there!"]);
        assert!(!transport.requests.lock().unwrap()[0].stream);
        assert_eq!(db.list(20).await.unwrap()[0].title, "Hello");
    }

    #[tokio::test]
    async fn test_empty_reply_is_failure() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, _) = controller(vec![Script::Reply("  ")], db, false);

        let outcome = controller.send("Hello").await.unwrap();
        assert_eq!(outcome, StreamOutcome::Failed(SERVICE_ERROR_REPLY.to_string()));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let db = Database::new_in_memory().unwrap();
        let (controller, transport, _) = controller(Vec::new(), db, true);

        assert!(matches!(
            controller.send("   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rename_delete() {
        let db = Database::new_in_memory().unwrap();
        let (controller, _, view) = controller(vec![stream(HI_THERE.to_vec())], db.clone(), true);
        controller.send("Hello").await.unwrap();
        let id = controller.current_conversation().unwrap().id;

        controller.new_chat();
        let history = controller.refresh_history().await;
        controller.open_chat(history[0].clone());
        assert_eq!(controller.current_conversation().unwrap().id, id);
        assert!(view
            .events()
            .contains(&ViewEvent::Message(Role::Assistant, "Hi there!".to_string())));

        let history = controller.rename_chat(&id, "Greetings").await;
        assert_eq!(history[0].title, "Greetings");
        assert_eq!(controller.current_conversation().unwrap().title, "Greetings");

        let history = controller.delete_chat(&id).await;
        assert!(history.is_empty());
        assert!(controller.current_conversation().is_none());
        assert_eq!(controller.phase(), StreamPhase::Idle);
    }
}
