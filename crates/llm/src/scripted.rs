use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::{StreamExt, stream};

use crate::backend::{
    BackendError, BackendResult, BoxFuture, ByteStream, ChatBackend, StatusSnafu,
};
use crate::event::{StreamEvent, parse_frame};
use crate::frame::FrameDecoder;
use crate::wire::{ChatRequest, ChatResponse, HistoryQuery, HistoryResponse, Role, WireMessage};

pub const SCRIPTED_BACKEND_ID: &str = "scripted";

/// Backend that replays a fixed event-stream body instead of calling a server.
///
/// Used for offline replays of recorded streams and as the test double for everything
/// above the transport.
pub struct ScriptedBackend {
    chunks: Vec<Bytes>,
    failure_status: Option<u16>,
    hold_open: bool,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    /// Replays `chunks` in order, one read per chunk.
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            failure_status: None,
            hold_open: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the given non-success status.
    pub fn failing(status: u16) -> Self {
        Self {
            failure_status: Some(status),
            ..Self::new(Vec::<Bytes>::new())
        }
    }

    /// Keeps the body open after the last chunk instead of ending it.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.lock_requests().clone()
    }

    fn record(&self, request: &ChatRequest) {
        self.lock_requests().push(request.clone());
    }

    fn check_status(&self, stage: &'static str) -> BackendResult<()> {
        match self.failure_status {
            Some(status) => StatusSnafu {
                stage,
                status,
                body: String::from("scripted failure"),
            }
            .fail(),
            None => Ok(()),
        }
    }

    fn lock_requests(&self) -> MutexGuard<'_, Vec<ChatRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replay_as_response(&self) -> ChatResponse {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in &self.chunks {
            frames.extend(decoder.feed(chunk));
        }
        frames.extend(decoder.flush());

        let mut response = ChatResponse {
            message: String::new(),
            references: Vec::new(),
            usage: None,
        };
        for frame in &frames {
            match parse_frame(frame) {
                StreamEvent::Text(text) => response.message.push_str(&text),
                StreamEvent::References(references) => response.references = references,
                StreamEvent::Done | StreamEvent::Error(_) => {}
            }
        }
        response
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        SCRIPTED_BACKEND_ID
    }

    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ByteStream>> {
        Box::pin(async move {
            self.record(request);
            self.check_status("scripted-open-stream")?;

            let replay = stream::iter(self.chunks.clone()).map(Ok::<_, BackendError>);

            let body: ByteStream = if self.hold_open {
                Box::pin(replay.chain(stream::pending()))
            } else {
                Box::pin(replay)
            };
            Ok(body)
        })
    }

    fn complete<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ChatResponse>> {
        Box::pin(async move {
            self.record(request);
            self.check_status("scripted-complete")?;
            Ok(self.replay_as_response())
        })
    }

    fn history<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryResponse>> {
        Box::pin(async move {
            self.check_status("scripted-history")?;

            // The newest request for a capture carries its whole history; append the replayed answer.
            let latest = self
                .lock_requests()
                .iter()
                .rev()
                .find(|request| request.capture_id == query.capture_id)
                .map(|request| request.messages.clone());

            let Some(mut messages) = latest else {
                return Ok(HistoryResponse::default());
            };
            messages.push(WireMessage::new(
                Role::Assistant,
                self.replay_as_response().message,
            ));

            let offset = query.offset.unwrap_or(0) as usize;
            let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
            Ok(HistoryResponse {
                messages: messages.into_iter().skip(offset).take(limit).collect(),
            })
        })
    }

    fn delete_history<'a>(&'a self, capture_id: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            self.check_status("scripted-delete-history")?;
            self.lock_requests()
                .retain(|request| request.capture_id != capture_id);
            Ok(())
        })
    }
}
