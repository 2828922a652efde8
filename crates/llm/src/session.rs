use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::ChatBackend;
use crate::event::{StreamHandler, dispatch, parse_frame};
use crate::frame::{Frame, FrameDecoder};
use crate::wire::ChatRequest;

/// Identifier for one streaming session.
///
/// Changes on every start so callbacks from a superseded session can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamSessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// How a session ended, from the controller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The body ended and every frame was dispatched.
    Completed,
    /// The token fired; nothing was reported through `on_error`.
    Cancelled,
    /// Transport failure, reported once through `on_error`.
    Failed,
}

/// A reserved slot on the controller. Consumed by [`StreamController::run`].
#[derive(Debug)]
pub struct StreamSession {
    id: StreamSessionId,
    token: CancellationToken,
}

impl StreamSession {
    pub fn id(&self) -> StreamSessionId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

struct ActiveSession {
    id: StreamSessionId,
    token: CancellationToken,
}

/// Owns the lifecycle of one outbound streaming request at a time.
///
/// Starting a session while another is active cancels the older one first.
pub struct StreamController {
    backend: Arc<dyn ChatBackend>,
    active: Mutex<Option<ActiveSession>>,
    next_session_id: AtomicU64,
}

impl StreamController {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            active: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn active_session(&self) -> Option<StreamSessionId> {
        self.lock_active().as_ref().map(|active| active.id)
    }

    pub fn is_active(&self) -> bool {
        self.active_session().is_some()
    }

    /// Reserves the controller for a new session, cancelling whichever session held it.
    ///
    /// The session token is a child of `cancel`, so either the caller's token or
    /// [`StreamController::cancel`] stops it.
    pub fn begin(&self, cancel: &CancellationToken) -> StreamSession {
        let id = StreamSessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let token = cancel.child_token();

        let previous = self.lock_active().replace(ActiveSession {
            id,
            token: token.clone(),
        });

        if let Some(previous) = previous {
            tracing::info!(
                previous_session_id = %previous.id,
                session_id = %id,
                "superseding active stream session"
            );
            previous.token.cancel();
        }

        StreamSession { id, token }
    }

    /// Cancels the active session, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let Some(active) = self.lock_active().take() else {
            return false;
        };

        tracing::debug!(session_id = %active.id, "cancelling active stream session");
        active.token.cancel();
        true
    }

    /// Convenience for [`begin`](Self::begin) followed by [`run`](Self::run).
    pub async fn start<H>(
        &self,
        request: &ChatRequest,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> StreamOutcome
    where
        H: StreamHandler + ?Sized,
    {
        let session = self.begin(cancel);
        self.run(session, request, handler).await
    }

    /// Issues the request and feeds every decoded event to `handler` until the body ends,
    /// the transport fails, or the session is cancelled.
    pub async fn run<H>(
        &self,
        session: StreamSession,
        request: &ChatRequest,
        handler: &mut H,
    ) -> StreamOutcome
    where
        H: StreamHandler + ?Sized,
    {
        let outcome = self.drive(&session, request, handler).await;
        self.release(session.id);

        tracing::debug!(
            session_id = %session.id,
            capture_id = %request.capture_id,
            ?outcome,
            "stream session finished"
        );
        outcome
    }

    async fn drive<H>(
        &self,
        session: &StreamSession,
        request: &ChatRequest,
        handler: &mut H,
    ) -> StreamOutcome
    where
        H: StreamHandler + ?Sized,
    {
        let token = &session.token;

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamOutcome::Cancelled,
            opened = self.backend.open_stream(request) => opened,
        };

        let mut body = match opened {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(
                    session_id = %session.id,
                    backend_id = %self.backend.id(),
                    error = %error,
                    "failed to open chat stream"
                );
                handler.on_error(error.to_string());
                return StreamOutcome::Failed;
            }
        };

        let mut decoder = FrameDecoder::new();
        let mut frame_count = 0usize;

        loop {
            // Frames from a chunk that already arrived are dispatched in full; the token is
            // only consulted again at the next read.
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(session_id = %session.id, frame_count, "stream read loop cancelled");
                    return StreamOutcome::Cancelled;
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        frame_count += 1;
                        Self::deliver(handler, &frame);
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        session_id = %session.id,
                        frame_count,
                        error = %error,
                        "chat stream failed mid-body"
                    );
                    handler.on_error(error.to_string());
                    return StreamOutcome::Failed;
                }
                None => break,
            }
        }

        if let Some(frame) = decoder.flush() {
            frame_count += 1;
            Self::deliver(handler, &frame);
        }

        tracing::trace!(session_id = %session.id, frame_count, "chat stream body ended");
        StreamOutcome::Completed
    }

    fn deliver<H>(handler: &mut H, frame: &Frame)
    where
        H: StreamHandler + ?Sized,
    {
        let event = parse_frame(frame);
        tracing::trace!(kind = event.kind(), "dispatching stream event");
        dispatch(handler, event);
    }

    fn release(&self, id: StreamSessionId) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|session| session.id == id) {
            *active = None;
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::event::{MALFORMED_EVENT_MESSAGE, UNKNOWN_EVENT_MESSAGE};
    use crate::scripted::ScriptedBackend;
    use crate::wire::{Reference, Role, WireMessage};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Text(String),
        References(usize),
        Done,
        Error(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        cancel_after_first_text: Option<Arc<StreamController>>,
    }

    impl StreamHandler for Recorder {
        fn on_text(&mut self, text: String) {
            self.calls.push(Call::Text(text));
            if let Some(controller) = self.cancel_after_first_text.take() {
                controller.cancel();
            }
        }

        fn on_references(&mut self, references: Vec<Reference>) {
            self.calls.push(Call::References(references.len()));
        }

        fn on_done(&mut self) {
            self.calls.push(Call::Done);
        }

        fn on_error(&mut self, message: String) {
            self.calls.push(Call::Error(message));
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("capture-1", vec![WireMessage::new(Role::User, "hi")])
    }

    fn controller(backend: ScriptedBackend) -> Arc<StreamController> {
        Arc::new(StreamController::new(Arc::new(backend)))
    }

    #[tokio::test]
    async fn text_split_across_chunks_arrives_as_one_event() {
        let controller = controller(ScriptedBackend::new([
            r#"data: {"type":"text","text":"Hel"#,
            "lo\"}\n\n",
        ]));
        let mut recorder = Recorder::default();

        let outcome = controller
            .start(&request(), &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.calls, vec![Call::Text("Hello".to_string())]);
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn events_are_routed_in_frame_order_and_errors_do_not_stop_the_stream() {
        let controller = controller(ScriptedBackend::new([
            "data: {\"type\":\"text\",\"text\":\"a\"}\n\ndata: {broken\n\n",
            ": keep-alive\n\ndata: {\"type\":\"mystery\"}\n\n",
            "data: {\"type\":\"references\",\"references\":[{\"id\":\"1\",\"title\":\"t\",\"url\":\"u\"}]}\n\n",
            "data: {\"type\":\"text\",\"text\":\"b\"}\n\ndata: {\"type\":\"done\"}",
        ]));
        let mut recorder = Recorder::default();

        controller
            .start(&request(), &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(
            recorder.calls,
            vec![
                Call::Text("a".to_string()),
                Call::Error(MALFORMED_EVENT_MESSAGE.to_string()),
                Call::Error(UNKNOWN_EVENT_MESSAGE.to_string()),
                Call::References(1),
                Call::Text("b".to_string()),
                Call::Done,
            ]
        );
    }

    #[tokio::test]
    async fn non_success_status_reports_exactly_one_error() {
        let controller = controller(ScriptedBackend::failing(500));
        let mut recorder = Recorder::default();

        let outcome = controller
            .start(&request(), &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(recorder.calls.len(), 1);
        assert!(matches!(&recorder.calls[0], Call::Error(message) if message.contains("500")));
    }

    #[tokio::test]
    async fn cancelled_token_before_start_fires_no_callbacks() {
        let controller = controller(ScriptedBackend::new(["data: {\"type\":\"done\"}\n\n"]));
        let token = CancellationToken::new();
        token.cancel();
        let mut recorder = Recorder::default();

        let outcome = controller.start(&request(), &mut recorder, &token).await;

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(recorder.calls.is_empty());
    }

    #[tokio::test]
    async fn cancel_finishes_the_current_chunk_then_stops_silently() {
        let controller = controller(
            ScriptedBackend::new([
                "data: {\"type\":\"text\",\"text\":\"one\"}\n\ndata: {\"type\":\"text\",\"text\":\"two\"}\n\n",
                "data: {\"type\":\"text\",\"text\":\"three\"}\n\n",
            ])
            .hold_open(),
        );
        let mut recorder = Recorder {
            cancel_after_first_text: Some(controller.clone()),
            ..Recorder::default()
        };

        let outcome = controller
            .start(&request(), &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(
            recorder.calls,
            vec![Call::Text("one".to_string()), Call::Text("two".to_string())]
        );
    }

    #[tokio::test]
    async fn starting_a_new_session_cancels_the_previous_one() {
        let controller = controller(
            ScriptedBackend::new(["data: {\"type\":\"text\",\"text\":\"x\"}\n\n"]).hold_open(),
        );

        let first = controller.begin(&CancellationToken::new());
        let first_token = first.token().clone();
        let first_id = first.id();
        let first_controller = controller.clone();
        let first_run = tokio::spawn(async move {
            let mut recorder = Recorder::default();
            let outcome = first_controller.run(first, &request(), &mut recorder).await;
            (outcome, recorder.calls)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = controller.begin(&CancellationToken::new());

        assert!(first_token.is_cancelled());
        assert_eq!(controller.active_session(), Some(second.id()));
        assert!(second.id() > first_id);

        let (outcome, calls) = first_run.await.unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(calls, vec![Call::Text("x".to_string())]);
        // The superseded run must not clear the newer session's slot.
        assert_eq!(controller.active_session(), Some(second.id()));
    }

    #[tokio::test]
    async fn cancel_without_active_session_is_a_no_op() {
        let controller = controller(ScriptedBackend::new(Vec::<&'static str>::new()));

        assert!(!controller.cancel());
    }
}
