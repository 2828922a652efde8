//! Conversation message list driven by the streaming controller.
//!
//! The assistant placeholder is addressed by its index, fixed when the turn starts. Callbacks
//! from any session other than the turn's own are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use recall_llm::{
    CancellationToken, ChatOptions, ChatRequest, ChatResponse, ContextSnapshot, Reference, Role,
    StreamController, StreamHandler, StreamOutcome, StreamSession, StreamSessionId,
};
use snafu::{ResultExt, ensure};

use crate::error::{BackendSnafu, ChatResult, EmptyMessageSnafu};
use crate::ids::ConversationId;
use crate::message::{
    Conversation, DEFAULT_CONVERSATION_TITLE, DEFAULT_TITLE_MAX_CHARS, Message, MessageStatus,
    derive_title,
};

/// Text shown in place of, or after, an answer the user stopped.
pub const CANCELLATION_NOTICE: &str = "Response cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveTurn {
    session: StreamSessionId,
    assistant_index: usize,
}

#[derive(Debug)]
struct TranscriptState {
    conversation: Conversation,
    active: Option<ActiveTurn>,
    failure: Option<String>,
}

impl TranscriptState {
    fn accepts(&self, session: StreamSessionId) -> Option<ActiveTurn> {
        self.active.filter(|turn| turn.session == session)
    }

    fn placeholder_mut(&mut self, turn: ActiveTurn) -> Option<&mut Message> {
        self.conversation.messages.get_mut(turn.assistant_index)
    }

    /// Records a user message and returns the request carrying the whole history.
    fn push_user(
        &mut self,
        text: &str,
        title_max_chars: usize,
        options: &ChatOptions,
    ) -> ChatRequest {
        let conversation = &mut self.conversation;
        let first_user_message = !conversation
            .messages
            .iter()
            .any(|message| message.role == Role::User);
        if first_user_message && conversation.title == DEFAULT_CONVERSATION_TITLE {
            conversation.title = derive_title(text, title_max_chars);
        }

        conversation.messages.push(Message::user(text));
        ChatRequest::new(conversation.id.to_string(), conversation.wire_history())
            .with_options(options.clone())
            .with_context(conversation.context().clone())
    }

    fn finish_turn(&mut self, turn: ActiveTurn) {
        let status = if self.failure.is_some() {
            MessageStatus::Error
        } else {
            MessageStatus::Sent
        };
        if let Some(placeholder) = self.placeholder_mut(turn) {
            placeholder.status = status;
        }
        self.active = None;
    }

    // Empty placeholder: notice replaces it. Partial answer: notice is appended after it.
    fn apply_cancellation(&mut self, turn: ActiveTurn) {
        self.active = None;
        let failed = self.failure.is_some();
        let Some(placeholder) = self.placeholder_mut(turn) else {
            return;
        };

        if !failed {
            placeholder.status = MessageStatus::Sent;
        }
        if placeholder.content.is_empty() {
            placeholder.content = CANCELLATION_NOTICE.to_string();
        } else {
            self.conversation
                .messages
                .push(Message::assistant(CANCELLATION_NOTICE));
        }
    }
}

/// A turn reserved on the controller but not yet streamed.
#[derive(Debug)]
pub struct PendingTurn {
    session: StreamSession,
    request: ChatRequest,
}

impl PendingTurn {
    pub fn session_id(&self) -> StreamSessionId {
        self.session.id()
    }

    pub fn request(&self) -> &ChatRequest {
        &self.request
    }
}

/// Shared handle over one conversation's messages.
///
/// Clones share state; every mutation goes through one mutex.
#[derive(Clone)]
pub struct Transcript {
    state: Arc<Mutex<TranscriptState>>,
    controller: Arc<StreamController>,
    options: ChatOptions,
    title_max_chars: usize,
}

impl Transcript {
    pub fn new(conversation: Conversation, controller: Arc<StreamController>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TranscriptState {
                conversation,
                active: None,
                failure: None,
            })),
            controller,
            options: ChatOptions::default(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_title_max_chars(mut self, title_max_chars: usize) -> Self {
        self.title_max_chars = title_max_chars;
        self
    }

    pub fn id(&self) -> ConversationId {
        self.lock_state().conversation.id
    }

    pub fn title(&self) -> String {
        self.lock_state().conversation.title.clone()
    }

    pub fn context(&self) -> ContextSnapshot {
        self.lock_state().conversation.context().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().conversation.messages.clone()
    }

    /// Copy of the whole conversation.
    pub fn conversation(&self) -> Conversation {
        self.lock_state().conversation.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// Message from the last `error` event of the current or most recent turn.
    pub fn failure(&self) -> Option<String> {
        self.lock_state().failure.clone()
    }

    /// Appends the user message and an empty assistant placeholder, then reserves the
    /// controller for the turn. Any session already running on the controller is cancelled,
    /// and a turn of this transcript still streaming is closed like [`cancel`](Self::cancel).
    pub fn append_user(&self, text: &str, cancel: &CancellationToken) -> ChatResult<PendingTurn> {
        ensure!(
            !text.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "append-user-message",
            }
        );

        let mut state = self.lock_state();
        if let Some(previous) = state.active {
            tracing::info!(
                conversation_id = %state.conversation.id,
                session_id = %previous.session,
                "superseding streaming turn of the same conversation"
            );
            state.apply_cancellation(previous);
        }
        let request = state.push_user(text, self.title_max_chars, &self.options);

        let messages = &mut state.conversation.messages;
        messages.push(Message::assistant_placeholder());
        let assistant_index = messages.len() - 1;

        let session = self.controller.begin(cancel);
        state.active = Some(ActiveTurn {
            session: session.id(),
            assistant_index,
        });
        state.failure = None;

        tracing::debug!(
            conversation_id = %state.conversation.id,
            session_id = %session.id(),
            message_count = request.messages.len(),
            "appended user message"
        );
        Ok(PendingTurn { session, request })
    }

    /// Streams a reserved turn into the placeholder and finalizes it once the session ends.
    pub async fn stream(&self, turn: PendingTurn) -> StreamOutcome {
        self.stream_inner(turn, None).await
    }

    /// Like [`stream`](Self::stream), also forwarding every event the transcript accepted
    /// to `observer`, after it was applied.
    pub async fn stream_observed(
        &self,
        turn: PendingTurn,
        observer: &mut dyn StreamHandler,
    ) -> StreamOutcome {
        self.stream_inner(turn, Some(observer)).await
    }

    async fn stream_inner(
        &self,
        turn: PendingTurn,
        observer: Option<&mut dyn StreamHandler>,
    ) -> StreamOutcome {
        let PendingTurn { session, request } = turn;
        let session_id = session.id();
        let mut handler = TranscriptHandler {
            state: Arc::clone(&self.state),
            session: session_id,
            observer,
        };

        let outcome = self.controller.run(session, &request, &mut handler).await;
        self.finalize(session_id, outcome);
        outcome
    }

    /// [`append_user`](Self::append_user) followed by [`stream`](Self::stream).
    pub async fn send(&self, text: &str) -> ChatResult<StreamOutcome> {
        self.send_with_cancel(text, &CancellationToken::new()).await
    }

    pub async fn send_with_cancel(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> ChatResult<StreamOutcome> {
        let turn = self.append_user(text, cancel)?;
        Ok(self.stream(turn).await)
    }

    /// Non-streaming turn: one request, one complete assistant message.
    pub async fn complete(&self, text: &str) -> ChatResult<ChatResponse> {
        ensure!(
            !text.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "complete-user-message",
            }
        );

        let request = self
            .lock_state()
            .push_user(text, self.title_max_chars, &self.options);

        let response = self
            .controller
            .backend()
            .complete(&request)
            .await
            .context(BackendSnafu {
                stage: "complete-chat",
            })?;

        let mut answer = Message::assistant(response.message.clone());
        answer.references = response.references.clone();
        self.lock_state().conversation.messages.push(answer);
        Ok(response)
    }

    /// Stops this transcript's in-progress turn. Returns false when nothing was streaming.
    ///
    /// An empty placeholder becomes the cancellation notice. A placeholder that already
    /// holds text is left as is and the notice follows it as a separate message.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        let Some(turn) = state.active else {
            return false;
        };

        if self.controller.active_session() == Some(turn.session) {
            self.controller.cancel();
        }
        state.apply_cancellation(turn);

        tracing::info!(
            conversation_id = %state.conversation.id,
            session_id = %turn.session,
            "cancelled transcript turn"
        );
        true
    }

    fn finalize(&self, session: StreamSessionId, outcome: StreamOutcome) {
        let mut state = self.lock_state();
        let Some(turn) = state.accepts(session) else {
            return;
        };

        match outcome {
            StreamOutcome::Completed => state.finish_turn(turn),
            StreamOutcome::Failed => {
                if let Some(placeholder) = state.placeholder_mut(turn) {
                    placeholder.status = MessageStatus::Error;
                }
                state.active = None;
            }
            // Superseded by another turn on the shared controller.
            StreamOutcome::Cancelled => state.apply_cancellation(turn),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TranscriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TranscriptHandler<'a> {
    state: Arc<Mutex<TranscriptState>>,
    session: StreamSessionId,
    observer: Option<&'a mut dyn StreamHandler>,
}

impl TranscriptHandler<'_> {
    /// Applies `apply` when the event belongs to the active turn. Returns whether it did.
    fn with_turn(
        &self,
        event: &'static str,
        apply: impl FnOnce(&mut TranscriptState, ActiveTurn),
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.accepts(self.session) {
            Some(turn) => {
                apply(&mut state, turn);
                true
            }
            None => {
                tracing::debug!(
                    session_id = %self.session,
                    event,
                    "dropping event for inactive stream session"
                );
                false
            }
        }
    }
}

impl StreamHandler for TranscriptHandler<'_> {
    fn on_text(&mut self, text: String) {
        let accepted = self.with_turn("text", |state, turn| {
            if let Some(placeholder) = state.placeholder_mut(turn) {
                placeholder.content.push_str(&text);
            }
        });
        if let Some(observer) = self.observer.as_deref_mut().filter(|_| accepted) {
            observer.on_text(text);
        }
    }

    fn on_references(&mut self, references: Vec<Reference>) {
        let forwarded = self.observer.is_some().then(|| references.clone());
        let accepted = self.with_turn("references", |state, turn| {
            if let Some(placeholder) = state.placeholder_mut(turn) {
                placeholder.references = references;
            }
        });
        if let (true, Some(observer), Some(references)) =
            (accepted, self.observer.as_deref_mut(), forwarded)
        {
            observer.on_references(references);
        }
    }

    fn on_done(&mut self) {
        let accepted = self.with_turn("done", TranscriptState::finish_turn);
        if let Some(observer) = self.observer.as_deref_mut().filter(|_| accepted) {
            observer.on_done();
        }
    }

    fn on_error(&mut self, message: String) {
        let forwarded = self.observer.is_some().then(|| message.clone());
        let accepted = self.with_turn("error", |state, turn| {
            tracing::warn!(
                conversation_id = %state.conversation.id,
                session_id = %turn.session,
                error = %message,
                "stream reported an error"
            );
            if let Some(placeholder) = state.placeholder_mut(turn) {
                placeholder.status = MessageStatus::Error;
            }
            state.failure = Some(message);
        });
        if let (true, Some(observer), Some(message)) =
            (accepted, self.observer.as_deref_mut(), forwarded)
        {
            observer.on_error(message);
        }
    }
}
