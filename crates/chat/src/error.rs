use recall_llm::BackendError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("cannot send without a knowledge source; enable brain mode or pick a source"))]
    EmptyContext { stage: &'static str },
    #[snafu(display("cannot send an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("chat id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("chat backend failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
}

impl ChatError {
    /// True for failures raised before any request left the client.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::EmptyContext { .. } | Self::EmptyMessage { .. })
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
