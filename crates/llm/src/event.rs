use serde::Deserialize;
use serde_json::Value;

use crate::frame::Frame;
use crate::wire::Reference;

/// Message reported when a payload carries no recognised `type`/`kind` tag.
pub const UNKNOWN_EVENT_MESSAGE: &str = "Unknown stream event type";
/// Message reported when a payload is not the structure its tag promises.
pub const MALFORMED_EVENT_MESSAGE: &str = "Failed to parse stream event";
/// Message used when an `error` frame omits its `error` field.
pub const UNSPECIFIED_ERROR_MESSAGE: &str = "Stream reported an unspecified error";

/// Typed result of parsing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    References(Vec<Reference>),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::References(_) => "references",
            Self::Done => "done",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
struct ReferencesPayload {
    references: Vec<Reference>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
}

/// Parses one frame into exactly one event.
///
/// Never fails: anything that is not a well-formed payload becomes [`StreamEvent::Error`],
/// which lets the read loop keep consuming the frames that follow.
pub fn parse_frame(frame: &Frame) -> StreamEvent {
    let payload = frame.payload().trim();

    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, payload_len = payload.len(), "stream frame is not valid JSON");
            return StreamEvent::Error(MALFORMED_EVENT_MESSAGE.to_string());
        }
    };

    let tag = value
        .get("type")
        .or_else(|| value.get("kind"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    let Some(tag) = tag else {
        tracing::warn!("stream frame has no event discriminator");
        return StreamEvent::Error(UNKNOWN_EVENT_MESSAGE.to_string());
    };

    let parsed = match tag.as_str() {
        "text" => {
            serde_json::from_value::<TextPayload>(value).map(|body| StreamEvent::Text(body.text))
        }
        "references" => serde_json::from_value::<ReferencesPayload>(value)
            .map(|body| StreamEvent::References(body.references)),
        "done" => Ok(StreamEvent::Done),
        "error" => serde_json::from_value::<ErrorPayload>(value).map(|body| {
            StreamEvent::Error(
                body.error
                    .unwrap_or_else(|| UNSPECIFIED_ERROR_MESSAGE.to_string()),
            )
        }),
        other => {
            tracing::warn!(event_type = %other, "stream frame has unknown event type");
            return StreamEvent::Error(UNKNOWN_EVENT_MESSAGE.to_string());
        }
    };

    parsed.unwrap_or_else(|error| {
        tracing::warn!(event_type = %tag, error = %error, "stream frame payload does not match its type");
        StreamEvent::Error(MALFORMED_EVENT_MESSAGE.to_string())
    })
}

/// Receiver for the four event kinds of one streaming session.
///
/// Handlers run synchronously inside the read loop, in frame order. Only `on_references` is
/// optional; the default drops the list.
pub trait StreamHandler: Send {
    fn on_text(&mut self, text: String);

    fn on_references(&mut self, references: Vec<Reference>) {
        tracing::trace!(reference_count = references.len(), "references ignored by handler");
    }

    fn on_done(&mut self);

    fn on_error(&mut self, message: String);
}

/// Routes one event to the matching handler method.
pub fn dispatch<H>(handler: &mut H, event: StreamEvent)
where
    H: StreamHandler + ?Sized,
{
    match event {
        StreamEvent::Text(text) => handler.on_text(text),
        StreamEvent::References(references) => handler.on_references(references),
        StreamEvent::Done => handler.on_done(),
        StreamEvent::Error(message) => handler.on_error(message),
    }
}
