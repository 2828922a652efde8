use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use snafu::Snafu;

use crate::wire::{ChatRequest, ChatResponse, HistoryQuery, HistoryResponse};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = BackendResult<Bytes>> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend endpoint '{endpoint}' is not configured"))]
    MissingEndpoint {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("backend response on `{stage}` has no body"))]
    MissingBody { stage: &'static str },
    #[snafu(display("failed to decode backend response on `{stage}`, {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
}

impl BackendError {
    /// HTTP status carried by the error, when the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { source, .. } | Self::DecodeResponse { source, .. } => {
                source.status().map(|status| status.as_u16())
            }
            Self::MissingEndpoint { .. } | Self::BuildClient { .. } | Self::MissingBody { .. } => {
                None
            }
        }
    }
}

/// The chat service this engine talks to.
///
/// Only `open_stream` is required by the streaming path; the other calls are the plain
/// request/response surface of the same service.
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;

    /// Issues a streaming request and yields the raw response body.
    ///
    /// A non-success status or a response without a body must fail here rather than
    /// surface as an empty stream.
    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ByteStream>>;

    fn complete<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ChatResponse>>;

    fn history<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryResponse>>;

    fn delete_history<'a>(&'a self, capture_id: &'a str) -> BoxFuture<'a, BackendResult<()>>;
}
