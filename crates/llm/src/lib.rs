//! Client side of the chat streaming protocol: frame decoding, event dispatch, the backend
//! transport and the single-flight session controller.

use std::sync::Arc;

pub mod backend;
pub mod event;
pub mod frame;
pub mod http;
pub mod scripted;
pub mod session;
pub mod wire;

pub use backend::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ByteStream, ChatBackend,
    DEFAULT_ENDPOINT, DEFAULT_REQUEST_TIMEOUT,
};
pub use event::{StreamEvent, StreamHandler, dispatch, parse_frame};
pub use frame::{DATA_PREFIX, Frame, FrameDecoder};
pub use http::{HTTP_BACKEND_ID, HttpChatBackend};
pub use scripted::{SCRIPTED_BACKEND_ID, ScriptedBackend};
pub use session::{StreamController, StreamOutcome, StreamSession, StreamSessionId};
pub use tokio_util::sync::CancellationToken;
pub use wire::{
    ChatOptions, ChatRequest, ChatResponse, ContextSnapshot, HistoryQuery, HistoryResponse,
    IdList, Reference, Role, ToggleState, Usage, WireMessage,
};

/// Builds the HTTP backend for `config`.
pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    let backend = HttpChatBackend::new(config)?;
    tracing::debug!(
        backend_id = HTTP_BACKEND_ID,
        endpoint = %backend.config().endpoint,
        "created chat backend"
    );
    Ok(Arc::new(backend))
}
