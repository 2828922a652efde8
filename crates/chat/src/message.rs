use std::time::{SystemTime, UNIX_EPOCH};

use recall_llm::{ContextSnapshot, Reference, Role, WireMessage};

use crate::ids::{ConversationId, MessageId};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;
const TITLE_ELLIPSIS: &str = "...";

/// Lifecycle status for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Sending,
    Sent,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_unix_seconds: i64,
    pub status: MessageStatus,
    pub references: Vec<Reference>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            created_at_unix_seconds: current_unix_timestamp_seconds(),
            status,
            references: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageStatus::Sent)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessageStatus::Sent)
    }

    /// Empty assistant message that streamed text is written into.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Sending)
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage::new(self.role, self.content.clone())
    }
}

/// A chat with its frozen knowledge-source selection.
///
/// The context snapshot is set once by [`Conversation::new`] and has no setter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at_unix_seconds: i64,
    context: ContextSnapshot,
    pub(crate) messages: Vec<Message>,
}

impl Conversation {
    pub fn new(title: impl Into<String>, context: ContextSnapshot) -> Self {
        Self {
            id: ConversationId::new_v7(),
            title: title.into(),
            created_at_unix_seconds: current_unix_timestamp_seconds(),
            context,
            messages: Vec::new(),
        }
    }

    pub fn context(&self) -> &ContextSnapshot {
        &self.context
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages that carry content, in wire form.
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(Message::to_wire)
            .collect()
    }
}

/// Derives a conversation title from its first user message.
///
/// Whitespace runs collapse to single spaces; text longer than `max_chars` is cut on a
/// character boundary and suffixed with `...`.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || max_chars == 0 {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }

    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }

    let mut title: String = collapsed.chars().take(max_chars).collect();
    title.truncate(title.trim_end().len());
    title.push_str(TITLE_ELLIPSIS);
    title
}

pub(crate) fn current_unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}
