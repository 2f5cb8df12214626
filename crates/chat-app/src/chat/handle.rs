use std::sync::Arc;

use arc_swap::ArcSwap;
use tandem_storage::{ConversationId, MessageContent, MessageId};
use tokio::sync::{mpsc, oneshot, watch};

use super::events::Command;
use super::snapshot::ConversationSnapshot;
use crate::error::{ChatResult, EngineStoppedSnafu};

/// UI-facing entry points into a running [`ChatEngine`](super::ChatEngine).
///
/// Every mutating call returns once the engine applied it locally; the remote
/// outcome shows up in later snapshots and, on failure, as a
/// [`Notification`](super::Notification). Cloning is cheap and every clone
/// talks to the same engine.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<ArcSwap<ConversationSnapshot>>,
    updates: watch::Receiver<u64>,
}

impl ChatHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: Arc<ArcSwap<ConversationSnapshot>>,
        updates: watch::Receiver<u64>,
    ) -> Self {
        Self {
            commands,
            snapshot,
            updates,
        }
    }

    /// Switches to `conversation_id` and resolves after its history loaded.
    pub async fn open(&self, conversation_id: ConversationId) -> ChatResult<()> {
        self.request("open-conversation", |reply| Command::Open {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn close(&self) -> ChatResult<()> {
        self.request("close-conversation", |reply| Command::Close { reply })
            .await
    }

    /// Returns the temporary id of the optimistic entry.
    pub async fn send(&self, content: MessageContent) -> ChatResult<MessageId> {
        self.request("send-message", |reply| Command::Send { content, reply })
            .await
    }

    pub async fn send_text(&self, body: impl Into<String>) -> ChatResult<MessageId> {
        self.send(MessageContent::text(body)).await
    }

    pub async fn edit(&self, message_id: MessageId, content: MessageContent) -> ChatResult<()> {
        self.request("edit-message", |reply| Command::Edit {
            message_id,
            content,
            reply,
        })
        .await
    }

    pub async fn delete(&self, message_id: MessageId) -> ChatResult<()> {
        self.request("delete-message", |reply| Command::Delete { message_id, reply })
            .await
    }

    /// Sets the local user's reaction, replacing any previous one.
    pub async fn react(&self, message_id: MessageId, emoji: impl Into<String>) -> ChatResult<()> {
        let emoji = emoji.into();
        self.request("add-reaction", |reply| Command::React {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    pub async fn unreact(&self, message_id: MessageId) -> ChatResult<()> {
        self.request("remove-reaction", |reply| Command::Unreact { message_id, reply })
            .await
    }

    pub async fn retry(&self, temp_id: MessageId) -> ChatResult<()> {
        self.request("retry-send", |reply| Command::Retry {
            message_id: temp_id,
            reply,
        })
        .await
    }

    pub async fn discard(&self, temp_id: MessageId) -> ChatResult<()> {
        self.request("discard-send", |reply| Command::Discard {
            message_id: temp_id,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self) -> ChatResult<()> {
        self.request("mark-read", |reply| Command::MarkRead { reply })
            .await
    }

    /// Refetches the full history and merges it into the current view.
    pub async fn refresh(&self) -> ChatResult<()> {
        self.request("refresh-messages", |reply| Command::Refresh { reply })
            .await
    }

    /// Reports composer activity: `true` per keystroke, `false` when cleared.
    pub fn set_typing(&self, active: bool) -> ChatResult<()> {
        self.commands
            .send(Command::Typing { active })
            .map_err(|_| EngineStoppedSnafu { stage: "set-typing" }.build())
    }

    pub fn snapshot(&self) -> Arc<ConversationSnapshot> {
        self.snapshot.load_full()
    }

    /// Waits for the next published snapshot.
    pub async fn changed(&mut self) -> ChatResult<Arc<ConversationSnapshot>> {
        self.updates
            .changed()
            .await
            .map_err(|_| EngineStoppedSnafu { stage: "watch-snapshot" }.build())?;
        Ok(self.snapshot())
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        build: impl FnOnce(oneshot::Sender<ChatResult<T>>) -> Command,
    ) -> ChatResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| EngineStoppedSnafu { stage }.build())?;
        response
            .await
            .map_err(|_| EngineStoppedSnafu { stage }.build())?
    }
}
