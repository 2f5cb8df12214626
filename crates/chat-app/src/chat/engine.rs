use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::OptionExt;
use tandem_backend::{BackendError, BackendResult, BoxFuture, ChannelEvent, ChatBackend, Subscription};
use tandem_storage::{
    Applied, Conversation, ConversationId, DEFAULT_MAX_TEXT_LEN, Message, MessageContent,
    MessageId, MessageStore, UserId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::events::{Action, Command, Completion, Notification};
use super::handle::ChatHandle;
use super::optimistic::{MutationKind, OptimisticCoordinator};
use super::snapshot::{ConversationSnapshot, SnapshotPublisher};
use super::typing::{DEFAULT_TYPING_TIMEOUT, LocalTyping, RemoteTyping};
use crate::error::{ChatError, ChatResult, NoConversationSnafu, SupersededSnafu};

pub const DEFAULT_REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub local_user: UserId,
    pub typing_timeout: Duration,
    pub remote_call_timeout: Duration,
    pub max_text_len: usize,
    /// Mark the conversation read on open and whenever someone else's message arrives.
    pub auto_mark_read: bool,
}

impl EngineConfig {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            remote_call_timeout: DEFAULT_REMOTE_CALL_TIMEOUT,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            auto_mark_read: true,
        }
    }
}

struct ActiveConversation {
    conversation_id: ConversationId,
    conversation: Option<Conversation>,
    store: MessageStore,
    subscription: Option<Subscription>,
    loading: bool,
}

enum Step {
    Command(Option<Command>),
    Completion(Completion),
    Channel(Option<ChannelEvent>),
    LocalTypingDue,
    RemoteTypingDue,
}

/// Owns all conversation state and serializes every mutation of it.
///
/// UI commands, channel events, remote-call completions and typing timers are
/// handled one at a time on a single task. Remote calls run on their own tasks
/// and only report back through the completion queue, tagged with the epoch
/// they were issued in; switching conversations bumps the epoch so late
/// results for the old conversation are dropped.
pub struct ChatEngine {
    backend: Arc<dyn ChatBackend>,
    config: EngineConfig,
    epoch: u64,
    active: Option<ActiveConversation>,
    pending_open: Option<oneshot::Sender<ChatResult<()>>>,
    local_typing: LocalTyping,
    remote_typing: RemoteTyping,
    optimistic: OptimisticCoordinator,
    publisher: SnapshotPublisher,
    notifications: mpsc::UnboundedSender<Notification>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl ChatEngine {
    /// Starts the engine task. Must be called from within a tokio runtime.
    pub fn spawn(
        backend: Arc<dyn ChatBackend>,
        config: EngineConfig,
    ) -> (ChatHandle, mpsc::UnboundedReceiver<Notification>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (publisher, snapshot, updates) = SnapshotPublisher::new();

        let engine = Self {
            backend,
            epoch: 0,
            active: None,
            pending_open: None,
            local_typing: LocalTyping::new(config.typing_timeout),
            remote_typing: RemoteTyping::new(config.typing_timeout),
            optimistic: OptimisticCoordinator::new(config.local_user.clone(), config.max_text_len),
            config,
            publisher,
            notifications: notification_tx,
            completions: completion_tx,
        };
        tokio::spawn(engine.run(command_rx, completion_rx));

        (ChatHandle::new(command_tx, snapshot, updates), notification_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        tracing::info!(
            backend = self.backend.id(),
            local_user = %self.config.local_user,
            "chat engine started"
        );

        loop {
            let local_deadline = self.local_typing.next_deadline();
            let remote_expiry = self.remote_typing.next_expiry();
            let subscription = self
                .active
                .as_mut()
                .and_then(|active| active.subscription.as_mut());

            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                Some(completion) = completions.recv() => Step::Completion(completion),
                event = next_channel_event(subscription) => Step::Channel(event),
                () = sleep_until(local_deadline) => Step::LocalTypingDue,
                () = sleep_until(remote_expiry) => Step::RemoteTypingDue,
            };

            match step {
                Step::Command(None | Some(Command::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Completion(completion) => self.handle_completion(completion),
                Step::Channel(event) => self.handle_channel_event(event),
                Step::LocalTypingDue => {
                    for conversation_id in self.local_typing.expire(Instant::now()) {
                        self.send_typing(conversation_id, false);
                    }
                }
                Step::RemoteTypingDue => {
                    if self.remote_typing.prune(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }

        self.deactivate();
        self.publish();
        tracing::info!("chat engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                conversation_id,
                reply,
            } => self.open(conversation_id, reply),
            Command::Close { reply } => {
                self.deactivate();
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Send { content, reply } => {
                let _ = reply.send(self.send(content));
            }
            Command::Edit {
                message_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.edit(message_id, content));
            }
            Command::Delete { message_id, reply } => {
                let _ = reply.send(self.delete(message_id));
            }
            Command::React {
                message_id,
                emoji,
                reply,
            } => {
                let _ = reply.send(self.react(message_id, &emoji));
            }
            Command::Unreact { message_id, reply } => {
                let _ = reply.send(self.unreact(message_id));
            }
            Command::Retry { message_id, reply } => {
                let _ = reply.send(self.retry(message_id));
            }
            Command::Discard { message_id, reply } => {
                let _ = reply.send(self.discard(message_id));
            }
            Command::MarkRead { reply } => {
                let _ = reply.send(self.mark_read());
            }
            Command::Refresh { reply } => {
                let _ = reply.send(self.refresh());
            }
            Command::Typing { active } => self.typing(active),
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn open(&mut self, conversation_id: ConversationId, reply: oneshot::Sender<ChatResult<()>>) {
        if let Some(active) = &self.active
            && active.conversation_id == conversation_id
        {
            if active.loading {
                if let Some(previous) = self.pending_open.replace(reply) {
                    let _ = previous.send(SupersededSnafu { stage: "open-conversation" }.fail());
                }
            } else {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        self.deactivate();
        tracing::info!(%conversation_id, "opening conversation");
        self.active = Some(ActiveConversation {
            store: MessageStore::new(conversation_id.clone(), self.config.local_user.clone()),
            conversation_id: conversation_id.clone(),
            conversation: None,
            subscription: None,
            loading: true,
        });
        self.pending_open = Some(reply);
        self.publish();

        let epoch = self.epoch;
        self.spawn_remote(
            "open-conversation",
            move |backend| Box::pin(load_conversation(backend, conversation_id)),
            move |result| Completion::Opened { epoch, result },
        );
    }

    /// Tears down the open conversation and invalidates everything in flight for it.
    fn deactivate(&mut self) {
        self.epoch += 1;
        if let Some(reply) = self.pending_open.take() {
            let _ = reply.send(SupersededSnafu { stage: "open-conversation" }.fail());
        }

        let Some(mut active) = self.active.take() else {
            return;
        };
        if self.local_typing.stop(&active.conversation_id).is_some() {
            self.send_typing(active.conversation_id.clone(), false);
        }
        if let Some(mut subscription) = active.subscription.take() {
            subscription.unsubscribe();
        }
        self.remote_typing.clear(&active.conversation_id);
        self.optimistic.clear();
        tracing::info!(conversation_id = %active.conversation_id, "closed conversation");
    }

    fn send(&mut self, content: MessageContent) -> ChatResult<MessageId> {
        let active = require_active(&mut self.active, "send-message")?;
        let temp_id =
            self.optimistic
                .begin_send(&mut active.store, content.clone(), unix_timestamp_ms())?;
        let conversation_id = active.conversation_id.clone();

        self.publish();
        self.spawn_send(conversation_id, temp_id.clone(), content);
        Ok(temp_id)
    }

    fn retry(&mut self, temp_id: MessageId) -> ChatResult<()> {
        let active = require_active(&mut self.active, "retry-send")?;
        let content = self.optimistic.retry(&mut active.store, &temp_id)?;
        let conversation_id = active.conversation_id.clone();

        tracing::debug!(%temp_id, attempts = ?self.optimistic.attempts(&temp_id), "retrying send");
        self.publish();
        self.spawn_send(conversation_id, temp_id, content);
        Ok(())
    }

    fn discard(&mut self, temp_id: MessageId) -> ChatResult<()> {
        let active = require_active(&mut self.active, "discard-send")?;
        self.optimistic.discard(&mut active.store, &temp_id)?;
        self.publish();
        Ok(())
    }

    fn edit(&mut self, message_id: MessageId, content: MessageContent) -> ChatResult<()> {
        let active = require_active(&mut self.active, MutationKind::Edit.stage())?;
        self.optimistic
            .begin_edit(&mut active.store, &message_id, content.clone())?;
        self.publish();

        let target = message_id.clone();
        self.spawn_mutation(message_id, MutationKind::Edit, move |backend| {
            backend.edit_message(target, content)
        });
        Ok(())
    }

    fn delete(&mut self, message_id: MessageId) -> ChatResult<()> {
        let active = require_active(&mut self.active, MutationKind::Delete.stage())?;
        self.optimistic.begin_delete(&mut active.store, &message_id)?;
        self.publish();

        let target = message_id.clone();
        self.spawn_mutation(message_id, MutationKind::Delete, move |backend| {
            backend.delete_message(target)
        });
        Ok(())
    }

    fn react(&mut self, message_id: MessageId, emoji: &str) -> ChatResult<()> {
        let active = require_active(&mut self.active, MutationKind::React.stage())?;
        let emoji = self
            .optimistic
            .begin_react(&mut active.store, &message_id, emoji)?;
        self.publish();

        let target = message_id.clone();
        self.spawn_mutation(message_id, MutationKind::React, move |backend| {
            backend.add_reaction(target, emoji)
        });
        Ok(())
    }

    fn unreact(&mut self, message_id: MessageId) -> ChatResult<()> {
        let active = require_active(&mut self.active, MutationKind::Unreact.stage())?;
        self.optimistic.begin_unreact(&mut active.store, &message_id)?;
        self.publish();

        let target = message_id.clone();
        self.spawn_mutation(message_id, MutationKind::Unreact, move |backend| {
            backend.remove_reaction(target)
        });
        Ok(())
    }

    fn mark_read(&mut self) -> ChatResult<()> {
        let conversation_id = self.active_id("mark-read")?;
        let epoch = self.epoch;
        self.spawn_remote(
            "mark-read",
            move |backend| backend.mark_read(conversation_id),
            move |result| Completion::MarkedRead { epoch, result },
        );
        Ok(())
    }

    fn refresh(&mut self) -> ChatResult<()> {
        let conversation_id = self.active_id("refresh-messages")?;
        let epoch = self.epoch;
        self.spawn_remote(
            "refresh-messages",
            move |backend| backend.fetch_messages(conversation_id),
            move |result| Completion::Refreshed { epoch, result },
        );
        Ok(())
    }

    fn typing(&mut self, active: bool) {
        let Ok(conversation_id) = self.active_id("set-typing") else {
            tracing::debug!("ignoring typing input without an open conversation");
            return;
        };

        let signal = if active {
            self.local_typing.on_input(&conversation_id, Instant::now())
        } else {
            self.local_typing.stop(&conversation_id)
        };
        if let Some(signal) = signal {
            self.send_typing(conversation_id, signal.is_active());
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Opened { epoch, result } => {
                if self.is_stale(epoch, "open-conversation") {
                    return;
                }
                self.finish_open(result);
            }
            Completion::Refreshed { epoch, result } => {
                if self.is_stale(epoch, "refresh-messages") {
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                match result {
                    Ok(messages) => {
                        if active.store.resync(messages).changed() {
                            self.publish();
                        }
                    }
                    Err(source) => {
                        tracing::warn!(error = %source, "refresh failed");
                        self.notify(
                            Action::Refresh,
                            None,
                            ChatError::Transport {
                                stage: "refresh-messages",
                                source,
                            },
                        );
                    }
                }
            }
            Completion::Sent {
                epoch,
                temp_id,
                result,
            } => {
                if self.is_stale(epoch, "send-message") {
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                match result {
                    Ok(message) => {
                        tracing::debug!(%temp_id, message_id = %message.id, "send confirmed");
                        self.optimistic
                            .confirm_send(&mut active.store, &temp_id, message);
                        let conversation_id = active.conversation_id.clone();
                        if self.local_typing.stop(&conversation_id).is_some() {
                            self.send_typing(conversation_id, false);
                        }
                        self.publish();
                    }
                    Err(source) => {
                        let flagged = self
                            .optimistic
                            .fail_send(&mut active.store, &temp_id, source.to_string());
                        if !flagged.changed() {
                            // The channel echo already confirmed this send.
                            tracing::debug!(%temp_id, error = %source, "ignoring failure of a reconciled send");
                            return;
                        }
                        tracing::warn!(%temp_id, error = %source, "send failed");
                        self.publish();
                        self.notify(
                            Action::Send,
                            Some(temp_id),
                            ChatError::Transport {
                                stage: "send-message",
                                source,
                            },
                        );
                    }
                }
            }
            Completion::Mutated {
                epoch,
                message_id,
                kind,
                result,
            } => {
                if self.is_stale(epoch, kind.stage()) {
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        self.optimistic.settle(&message_id);
                        self.publish();
                    }
                    Err(source) if kind == MutationKind::Delete && source.is_not_found() => {
                        // Already gone remotely, so the tombstone stands.
                        tracing::debug!(%message_id, error = %source, "delete target vanished remotely");
                        self.optimistic.settle(&message_id);
                        self.publish();
                    }
                    Err(source) => {
                        tracing::warn!(%message_id, ?kind, error = %source, "remote change failed, rolling back");
                        self.optimistic.rollback(&mut active.store, &message_id);
                        self.publish();
                        let error =
                            ChatError::from_backend(kind.stage(), Some(message_id.as_str()), source);
                        self.notify(kind.into(), Some(message_id), error);
                    }
                }
            }
            Completion::MarkedRead { epoch, result } => {
                if self.is_stale(epoch, "mark-read") {
                    return;
                }
                if let Err(source) = result {
                    tracing::warn!(error = %source, "mark read failed");
                    self.notify(
                        Action::MarkRead,
                        None,
                        ChatError::Transport {
                            stage: "mark-read",
                            source,
                        },
                    );
                }
            }
            Completion::TypingSent {
                conversation_id,
                active,
                result,
            } => {
                // Typing is best effort; the next keystroke sends a fresh signal.
                if let Err(error) = result {
                    tracing::warn!(%conversation_id, active, %error, "typing signal failed");
                }
            }
        }
    }

    fn finish_open(&mut self, result: BackendResult<LoadedConversation>) {
        let reply = self.pending_open.take();
        match result {
            Ok((subscription, conversation, messages)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.store.resync(messages);
                active.conversation = Some(conversation);
                active.loading = false;
                tracing::info!(
                    conversation_id = %active.conversation_id,
                    subscription_id = subscription.id(),
                    messages = active.store.len(),
                    "conversation ready"
                );
                active.subscription = Some(subscription);

                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                if self.config.auto_mark_read {
                    let _ = self.mark_read();
                }
            }
            Err(source) => {
                tracing::warn!(error = %source, "failed to open conversation");
                self.active = None;
                self.epoch += 1;
                self.optimistic.clear();
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ChatError::Transport {
                        stage: "open-conversation",
                        source,
                    }));
                }
            }
        }
    }

    fn handle_channel_event(&mut self, event: Option<ChannelEvent>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(event) = event else {
            tracing::warn!(conversation_id = %active.conversation_id, "event channel closed");
            active.subscription = None;
            return;
        };

        let local_user = &self.config.local_user;
        let conversation_id = &active.conversation_id;
        let mut incoming = false;
        let applied = match event {
            ChannelEvent::NewMessage(message) if &message.sender_id == local_user => {
                match self.optimistic.match_echo(&mut active.store, &message) {
                    Some(_) => Applied::Changed,
                    None => active.store.append(message),
                }
            }
            ChannelEvent::NewMessage(message) => {
                let stopped_typing = self.remote_typing.stop(conversation_id, &message.sender_id);
                let appended = active.store.append(message).changed();
                incoming = appended;
                Applied::from_changed(stopped_typing || appended)
            }
            ChannelEvent::Edited {
                message_id,
                content,
            } => active.store.apply_edit(&message_id, content),
            ChannelEvent::Deleted { message_id } => active.store.apply_delete(&message_id),
            ChannelEvent::Delivered {
                message_id,
                delivered_at_unix_ms,
            } => active
                .store
                .apply_delivery(&message_id, delivered_at_unix_ms),
            ChannelEvent::Reaction(event) => active.store.apply_reaction_event(&event),
            ChannelEvent::ReadReceipt {
                message_id,
                read_at_unix_ms,
            } => active
                .store
                .apply_read_receipt(&message_id, read_at_unix_ms),
            // Our own signal echoed back.
            ChannelEvent::Typing { user_id, .. } if &user_id == local_user => Applied::Unchanged,
            ChannelEvent::Typing {
                user_id,
                active: true,
            } => Applied::from_changed(self.remote_typing.observe(
                conversation_id,
                &user_id,
                Instant::now(),
            )),
            ChannelEvent::Typing {
                user_id,
                active: false,
            } => Applied::from_changed(self.remote_typing.stop(conversation_id, &user_id)),
        };

        if applied.changed() {
            self.publish();
        }
        if incoming && self.config.auto_mark_read {
            let _ = self.mark_read();
        }
    }

    fn publish(&self) {
        let snapshot = match &self.active {
            Some(active) => ConversationSnapshot {
                version: 0,
                conversation_id: Some(active.conversation_id.clone()),
                conversation: active.conversation.clone(),
                loading: active.loading,
                messages: active.store.snapshot(),
                changing: self.optimistic.in_flight_ids(),
                typing_user_ids: self
                    .remote_typing
                    .typing_users(&active.conversation_id, Instant::now()),
            },
            None => ConversationSnapshot::default(),
        };
        self.publisher.publish(snapshot);
    }

    fn notify(&self, action: Action, target: Option<MessageId>, error: ChatError) {
        let _ = self.notifications.send(Notification::Failed {
            action,
            target,
            error,
        });
    }

    fn is_stale(&self, epoch: u64, stage: &'static str) -> bool {
        let stale = epoch != self.epoch;
        if stale {
            tracing::debug!(stage, epoch, current = self.epoch, "dropping result for a closed conversation");
        }
        stale
    }

    fn active_id(&self, stage: &'static str) -> ChatResult<ConversationId> {
        self.active
            .as_ref()
            .map(|active| active.conversation_id.clone())
            .context(NoConversationSnafu { stage })
    }

    fn send_typing(&self, conversation_id: ConversationId, active: bool) {
        let target = conversation_id.clone();
        self.spawn_remote(
            "set-typing",
            move |backend| backend.set_typing(target, active),
            move |result| Completion::TypingSent {
                conversation_id,
                active,
                result,
            },
        );
    }

    fn spawn_send(&self, conversation_id: ConversationId, temp_id: MessageId, content: MessageContent) {
        let epoch = self.epoch;
        let kind = content.kind();
        self.spawn_remote(
            "send-message",
            move |backend| backend.send_message(conversation_id, content, kind),
            move |result| Completion::Sent {
                epoch,
                temp_id,
                result,
            },
        );
    }

    fn spawn_mutation<F>(&self, message_id: MessageId, kind: MutationKind, call: F)
    where
        F: for<'a> FnOnce(&'a dyn ChatBackend) -> BoxFuture<'a, BackendResult<()>> + Send + 'static,
    {
        let epoch = self.epoch;
        self.spawn_remote(kind.stage(), call, move |result| Completion::Mutated {
            epoch,
            message_id,
            kind,
            result,
        });
    }

    /// Runs one bounded remote call off the engine task and queues its completion.
    fn spawn_remote<T, F, C>(&self, stage: &'static str, call: F, complete: C)
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a dyn ChatBackend) -> BoxFuture<'a, BackendResult<T>> + Send + 'static,
        C: FnOnce(BackendResult<T>) -> Completion + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let completions = self.completions.clone();
        let limit = self.config.remote_call_timeout;
        tokio::spawn(async move {
            let result = bounded(stage, limit, call(&*backend)).await;
            // The engine is gone; nobody is left to care about the result.
            let _ = completions.send(complete(result));
        });
    }
}

pub(crate) type LoadedConversation = (Subscription, Conversation, Vec<Message>);

/// Subscribes before fetching so nothing published in between is missed.
async fn load_conversation(
    backend: &dyn ChatBackend,
    conversation_id: ConversationId,
) -> BackendResult<LoadedConversation> {
    let subscription = backend.subscribe(conversation_id.clone()).await?;
    let conversation = backend.fetch_conversation(conversation_id.clone()).await?;
    let messages = backend.fetch_messages(conversation_id).await?;
    Ok((subscription, conversation, messages))
}

fn require_active<'a>(
    active: &'a mut Option<ActiveConversation>,
    stage: &'static str,
) -> ChatResult<&'a mut ActiveConversation> {
    active.as_mut().context(NoConversationSnafu { stage })
}

async fn bounded<T>(
    stage: &'static str,
    limit: Duration,
    call: BoxFuture<'_, BackendResult<T>>,
) -> BackendResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            stage,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

async fn next_channel_event(subscription: Option<&mut Subscription>) -> Option<ChannelEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}
