//! Conversations on top of the streaming client: context selection, transcripts and settings.

pub mod context;
pub mod error;
pub mod ids;
pub mod message;
pub mod settings;
pub mod surface;
pub mod transcript;

pub use context::{ContextDraft, ContextMode, build_snapshot};
pub use error::{ChatError, ChatResult};
pub use ids::{ConversationId, MessageId};
pub use message::{
    Conversation, DEFAULT_CONVERSATION_TITLE, DEFAULT_TITLE_MAX_CHARS, Message, MessageStatus,
    derive_title,
};
pub use settings::{ChatSettings, SettingsError, SettingsStore};
pub use surface::ChatSurface;
pub use transcript::{CANCELLATION_NOTICE, PendingTurn, Transcript};
