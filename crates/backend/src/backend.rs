use std::future::Future;
use std::pin::Pin;

use tandem_storage::{ContentKind, Conversation, ConversationId, Message, MessageContent, MessageId};

use super::channel::Subscription;
use super::error::BackendResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote messaging capability consumed by the engine.
///
/// Implementations own transport, storage and authentication. Every call is
/// asynchronous and may fail with a [`BackendError`](super::BackendError); the
/// engine never assumes delivery order between calls and channel events.
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;

    fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Conversation>>;

    /// Full ordered history, used for the initial snapshot and for resynchronization.
    fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Vec<Message>>>;

    fn send_message(
        &self,
        conversation_id: ConversationId,
        content: MessageContent,
        kind: ContentKind,
    ) -> BoxFuture<'_, BackendResult<Message>>;

    fn edit_message(
        &self,
        message_id: MessageId,
        content: MessageContent,
    ) -> BoxFuture<'_, BackendResult<()>>;

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, BackendResult<()>>;

    fn add_reaction(&self, message_id: MessageId, emoji: String)
    -> BoxFuture<'_, BackendResult<()>>;

    fn remove_reaction(&self, message_id: MessageId) -> BoxFuture<'_, BackendResult<()>>;

    fn mark_read(&self, conversation_id: ConversationId) -> BoxFuture<'_, BackendResult<()>>;

    fn set_typing(
        &self,
        conversation_id: ConversationId,
        active: bool,
    ) -> BoxFuture<'_, BackendResult<()>>;

    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Subscription>>;
}
