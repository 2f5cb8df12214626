use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    ContentKind, Conversation, ConversationId, Message, MessageContent, MessageId, Reaction,
    ReactionEvent, UserId, reactions,
};
use tokio::sync::mpsc;

use super::backend::{BoxFuture, ChatBackend};
use super::channel::{RawEnvelope, RawEvent, RawMessage, Subscription, make_subscription};
use super::error::{
    BackendResult, EventIdSnafu, NotFoundSnafu, RejectedSnafu, UnavailableSnafu,
};

pub const MEMORY_BACKEND_ID: &str = "memory";

/// Remote calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchConversation,
    FetchMessages,
    Send,
    Edit,
    Delete,
    AddReaction,
    RemoveReaction,
    MarkRead,
    SetTyping,
    Subscribe,
}

impl Operation {
    fn stage(self) -> &'static str {
        match self {
            Self::FetchConversation => "memory-fetch-conversation",
            Self::FetchMessages => "memory-fetch-messages",
            Self::Send => "memory-send-message",
            Self::Edit => "memory-edit-message",
            Self::Delete => "memory-delete-message",
            Self::AddReaction => "memory-add-reaction",
            Self::RemoveReaction => "memory-remove-reaction",
            Self::MarkRead => "memory-mark-read",
            Self::SetTyping => "memory-set-typing",
            Self::Subscribe => "memory-subscribe",
        }
    }
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<RawEnvelope>>>,
    injected_failures: HashMap<Operation, usize>,
    typing_signals: Vec<(ConversationId, bool)>,
    read_marks: Vec<ConversationId>,
    next_message_seq: u64,
    last_timestamp_ms: u64,
}

impl MemoryState {
    fn take_failure(&mut self, operation: Operation) -> BackendResult<()> {
        if let Some(remaining) = self.injected_failures.get_mut(&operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return UnavailableSnafu {
                stage: operation.stage(),
                details: "injected failure".to_string(),
            }
            .fail();
        }
        Ok(())
    }

    fn next_timestamp(&mut self) -> u64 {
        // Strictly increasing so backend order matches arrival order.
        let now = unix_timestamp_ms().max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms = now;
        now
    }

    fn next_message_id(&mut self) -> BackendResult<MessageId> {
        self.next_message_seq += 1;
        MessageId::parse_confirmed(&format!("m-{}", self.next_message_seq)).context(EventIdSnafu {
            stage: "memory-next-message-id",
        })
    }

    fn find_message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|message| &message.id == message_id)
    }

    fn live_message_mut(
        &mut self,
        message_id: &MessageId,
        stage: &'static str,
    ) -> BackendResult<&mut Message> {
        let message = self.find_message_mut(message_id).context(NotFoundSnafu {
            stage,
            entity: "message",
            id: message_id.to_string(),
        })?;
        ensure!(
            !message.deleted,
            NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            }
        );
        Ok(message)
    }

    fn broadcast(&mut self, conversation_id: &ConversationId, event: RawEvent) {
        let Some(senders) = self.subscribers.get_mut(conversation_id) else {
            return;
        };
        senders.retain(|sender| !sender.is_closed());
        for sender in senders.iter() {
            let _ = sender.send(RawEnvelope::new(conversation_id, event.clone()));
        }
    }
}

/// In-process backend with real id assignment and fan-out to live subscriptions.
///
/// Every call observes `latency` before touching state, and failures can be
/// injected per operation. Remote users are simulated with the `remote_*`
/// helpers, which go through the same broadcast path as local calls.
pub struct MemoryBackend {
    local_user: UserId,
    latency: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            latency: Duration::ZERO,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Registers a conversation, optionally seeded with history.
    pub fn insert_conversation(&self, conversation: Conversation, history: Vec<Message>) {
        let mut state = self.lock();
        if let Some(last) = history.iter().map(|message| message.created_at_unix_ms).max() {
            state.last_timestamp_ms = state.last_timestamp_ms.max(last);
        }
        state.messages.insert(conversation.id.clone(), history);
        state
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Makes the next `count` calls of `operation` fail with a transport error.
    pub fn fail_next(&self, operation: Operation, count: usize) {
        *self.lock().injected_failures.entry(operation).or_default() += count;
    }

    pub fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        self.lock()
            .subscribers
            .get(conversation_id)
            .map_or(0, |senders| senders.iter().filter(|sender| !sender.is_closed()).count())
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn typing_signals(&self) -> Vec<(ConversationId, bool)> {
        self.lock().typing_signals.clone()
    }

    pub fn read_marks(&self) -> Vec<ConversationId> {
        self.lock().read_marks.clone()
    }

    /// Stores and broadcasts a message authored by someone else.
    pub fn remote_send(
        &self,
        conversation_id: &ConversationId,
        sender_id: UserId,
        content: MessageContent,
    ) -> BackendResult<Message> {
        let mut state = self.lock();
        let id = state.next_message_id()?;
        let created_at = state.next_timestamp();
        let message = Message::new(id, conversation_id.clone(), sender_id, content, created_at);
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        state.broadcast(
            conversation_id,
            RawEvent::NewMessage {
                message: Some(RawMessage::from(&message)),
            },
        );
        Ok(message)
    }

    /// Pushes an arbitrary wire event to subscribers without touching stored state.
    pub fn push_raw(&self, conversation_id: &ConversationId, event: RawEvent) {
        self.lock().broadcast(conversation_id, event);
    }

    pub fn remote_typing(&self, conversation_id: &ConversationId, user_id: &UserId, typing: bool) {
        self.push_raw(
            conversation_id,
            RawEvent::TypingSignal {
                user_id: Some(user_id.to_string()),
                typing: Some(typing),
            },
        );
    }

    /// Records a read receipt from the counterpart and broadcasts it.
    pub fn remote_read(&self, conversation_id: &ConversationId, message_id: &MessageId) {
        let mut state = self.lock();
        let read_at = state.next_timestamp();
        if let Some(message) = state.find_message_mut(message_id) {
            message.read_at_unix_ms = Some(read_at);
        }
        state.broadcast(
            conversation_id,
            RawEvent::ReadReceipt {
                message_id: Some(message_id.to_string()),
                read_at: Some(read_at),
            },
        );
    }

    pub fn remote_react(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        user_id: &UserId,
        emoji: &str,
    ) {
        let mut state = self.lock();
        if let Some(message) = state.find_message_mut(message_id) {
            let event = ReactionEvent::Add(Reaction::new(
                message_id.clone(),
                user_id.clone(),
                emoji,
            ));
            message.reactions = reactions::fold(&message.reactions, &event);
        }
        state.broadcast(
            conversation_id,
            RawEvent::ReactionAdd {
                message_id: Some(message_id.to_string()),
                user_id: Some(user_id.to_string()),
                emoji: Some(emoji.to_string()),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // State stays consistent across a panicking holder, so recover the guard.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn ensure_conversation(
        state: &MemoryState,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> BackendResult<()> {
        ensure!(
            state.conversations.contains_key(conversation_id),
            NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            }
        );
        Ok(())
    }
}

impl ChatBackend for MemoryBackend {
    fn id(&self) -> &str {
        MEMORY_BACKEND_ID
    }

    fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::FetchConversation)?;
            state
                .conversations
                .get(&conversation_id)
                .cloned()
                .context(NotFoundSnafu {
                    stage: "memory-fetch-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }

    fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Vec<Message>>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::FetchMessages)?;
            Self::ensure_conversation(&state, &conversation_id, "memory-fetch-messages")?;
            let mut messages = state
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            messages.sort_by(|left, right| left.order_key().cmp(&right.order_key()));
            Ok(messages)
        })
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        content: MessageContent,
        kind: ContentKind,
    ) -> BoxFuture<'_, BackendResult<Message>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::Send)?;
            Self::ensure_conversation(&state, &conversation_id, "memory-send-message")?;
            ensure!(
                content.kind() == kind,
                RejectedSnafu {
                    stage: "memory-send-message",
                    details: format!(
                        "declared type '{}' does not match payload '{}'",
                        kind.as_str(),
                        content.kind().as_str()
                    ),
                }
            );

            let id = state.next_message_id()?;
            let created_at = state.next_timestamp();
            let message = Message::new(
                id,
                conversation_id.clone(),
                self.local_user.clone(),
                content,
                created_at,
            );
            state
                .messages
                .entry(conversation_id.clone())
                .or_default()
                .push(message.clone());
            state.broadcast(
                &conversation_id,
                RawEvent::NewMessage {
                    message: Some(RawMessage::from(&message)),
                },
            );
            Ok(message)
        })
    }

    fn edit_message(
        &self,
        message_id: MessageId,
        content: MessageContent,
    ) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::Edit)?;
            let local_user = self.local_user.clone();
            let message = state.live_message_mut(&message_id, "memory-edit-message")?;
            ensure!(
                message.sender_id == local_user,
                RejectedSnafu {
                    stage: "memory-edit-message",
                    details: format!("message '{message_id}' belongs to another user"),
                }
            );
            message.content = content.clone();
            message.edited = true;
            let conversation_id = message.conversation_id.clone();
            state.broadcast(
                &conversation_id,
                RawEvent::MessageUpdate {
                    message_id: Some(message_id.to_string()),
                    content: Some(content),
                    deleted: None,
                    delivered_at: None,
                },
            );
            Ok(())
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::Delete)?;
            let local_user = self.local_user.clone();
            let message = state.live_message_mut(&message_id, "memory-delete-message")?;
            ensure!(
                message.sender_id == local_user,
                RejectedSnafu {
                    stage: "memory-delete-message",
                    details: format!("message '{message_id}' belongs to another user"),
                }
            );
            message.deleted = true;
            let conversation_id = message.conversation_id.clone();
            state.broadcast(
                &conversation_id,
                RawEvent::MessageUpdate {
                    message_id: Some(message_id.to_string()),
                    content: None,
                    deleted: Some(true),
                    delivered_at: None,
                },
            );
            Ok(())
        })
    }

    fn add_reaction(
        &self,
        message_id: MessageId,
        emoji: String,
    ) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::AddReaction)?;
            let event = ReactionEvent::Add(Reaction::new(
                message_id.clone(),
                self.local_user.clone(),
                emoji.clone(),
            ));
            let message = state.live_message_mut(&message_id, "memory-add-reaction")?;
            message.reactions = reactions::fold(&message.reactions, &event);
            let conversation_id = message.conversation_id.clone();
            state.broadcast(
                &conversation_id,
                RawEvent::ReactionAdd {
                    message_id: Some(message_id.to_string()),
                    user_id: Some(self.local_user.to_string()),
                    emoji: Some(emoji),
                },
            );
            Ok(())
        })
    }

    fn remove_reaction(&self, message_id: MessageId) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::RemoveReaction)?;
            let event = ReactionEvent::Remove {
                message_id: message_id.clone(),
                user_id: self.local_user.clone(),
                emoji: None,
            };
            let message = state.live_message_mut(&message_id, "memory-remove-reaction")?;
            message.reactions = reactions::fold(&message.reactions, &event);
            let conversation_id = message.conversation_id.clone();
            state.broadcast(
                &conversation_id,
                RawEvent::ReactionRemove {
                    message_id: Some(message_id.to_string()),
                    user_id: Some(self.local_user.to_string()),
                    emoji: None,
                },
            );
            Ok(())
        })
    }

    fn mark_read(&self, conversation_id: ConversationId) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::MarkRead)?;
            Self::ensure_conversation(&state, &conversation_id, "memory-mark-read")?;
            state.read_marks.push(conversation_id);
            Ok(())
        })
    }

    fn set_typing(
        &self,
        conversation_id: ConversationId,
        active: bool,
    ) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::SetTyping)?;
            state.typing_signals.push((conversation_id.clone(), active));
            state.broadcast(
                &conversation_id,
                RawEvent::TypingSignal {
                    user_id: Some(self.local_user.to_string()),
                    typing: Some(active),
                },
            );
            Ok(())
        })
    }

    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, BackendResult<Subscription>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.lock();
            state.take_failure(Operation::Subscribe)?;
            Self::ensure_conversation(&state, &conversation_id, "memory-subscribe")?;
            let (sender, subscription) = make_subscription(conversation_id.clone());
            state.subscribers.entry(conversation_id).or_default().push(sender);
            Ok(subscription)
        })
    }
}

fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}
