use std::sync::Arc;

use recall_llm::{
    ChatBackend, ChatOptions, HistoryQuery, HistoryResponse, StreamController, create_backend,
};
use snafu::{ResultExt, ensure};

use crate::context::{ContextDraft, build_snapshot};
use crate::error::{BackendSnafu, ChatResult, EmptyContextSnafu, EmptyMessageSnafu};
use crate::message::{Conversation, DEFAULT_TITLE_MAX_CHARS, derive_title};
use crate::settings::ChatSettings;
use crate::transcript::Transcript;

/// Entry point for one chat window.
///
/// Every transcript started here shares a single controller, so at most one answer streams
/// at a time across all of them.
pub struct ChatSurface {
    controller: Arc<StreamController>,
    options: ChatOptions,
    title_max_chars: usize,
}

impl ChatSurface {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            controller: Arc::new(StreamController::new(backend)),
            options: ChatOptions::default(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
        }
    }

    pub fn from_settings(settings: &ChatSettings) -> ChatResult<Self> {
        let backend = create_backend(settings.to_backend_config()).context(BackendSnafu {
            stage: "create-chat-backend",
        })?;
        Ok(Self::new(backend).with_settings(settings))
    }

    /// Applies request options and title length from `settings`, keeping the backend.
    pub fn with_settings(mut self, settings: &ChatSettings) -> Self {
        self.options = settings.chat_options();
        self.title_max_chars = settings.title_max_chars;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        self.controller.backend()
    }

    /// Freezes the draft into a new conversation titled after `first_message`.
    ///
    /// Rejected without touching the draft when nothing is selected or the message is blank.
    /// On success the draft is reset for the next conversation.
    pub fn start_conversation(
        &self,
        draft: &mut ContextDraft,
        first_message: &str,
    ) -> ChatResult<Transcript> {
        ensure!(
            draft.can_send(),
            EmptyContextSnafu {
                stage: "start-conversation",
            }
        );
        ensure!(
            !first_message.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "start-conversation",
            }
        );

        let context = build_snapshot(draft);
        draft.reset();

        let conversation = Conversation::new(
            derive_title(first_message, self.title_max_chars),
            context,
        );
        tracing::info!(
            conversation_id = %conversation.id,
            brain = conversation.context().is_brain(),
            "started conversation"
        );

        Ok(Transcript::new(conversation, Arc::clone(&self.controller))
            .with_options(self.options.clone())
            .with_title_max_chars(self.title_max_chars))
    }

    /// Stops whichever answer is streaming on this surface.
    pub fn cancel_active(&self) -> bool {
        self.controller.cancel()
    }

    pub async fn history(&self, query: &HistoryQuery) -> ChatResult<HistoryResponse> {
        self.backend().history(query).await.context(BackendSnafu {
            stage: "load-chat-history",
        })
    }

    pub async fn delete_history(&self, transcript: &Transcript) -> ChatResult<()> {
        let capture_id = transcript.id().to_string();
        self.backend()
            .delete_history(&capture_id)
            .await
            .context(BackendSnafu {
                stage: "delete-chat-history",
            })
    }
}
