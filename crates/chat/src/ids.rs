use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult, InvalidIdSnafu};

// One macro keeps every id wrapper structurally identical.
macro_rules! define_chat_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mints a fresh, time-ordered id.
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> ChatResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-chat-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> ChatResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_chat_id!(ConversationId, "conversation-id");
define_chat_id!(MessageId, "message-id");
