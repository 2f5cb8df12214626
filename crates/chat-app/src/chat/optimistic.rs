use std::collections::HashMap;

use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    Applied, Message, MessageContent, MessageId, MessageStore, Reaction, ReactionEvent, SendState,
    UserId, reactions,
};

use crate::error::{ChatResult, ConflictSnafu, ValidationSnafu};

/// Local mutation awaiting its remote acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Edit,
    Delete,
    React,
    Unreact,
}

impl MutationKind {
    pub fn stage(self) -> &'static str {
        match self {
            Self::Edit => "edit-message",
            Self::Delete => "delete-message",
            Self::React => "add-reaction",
            Self::Unreact => "remove-reaction",
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    content: MessageContent,
    attempts: u32,
}

#[derive(Debug, Clone)]
enum Undo {
    /// Copy of the message before an edit.
    Edit(Message),
    /// Copy of the message before a local delete.
    Delete(Message),
    /// The local user's reaction before a react or unreact.
    OwnReaction(Option<Reaction>),
}

#[derive(Debug, Clone)]
struct PendingMutation {
    kind: MutationKind,
    undo: Undo,
}

/// Applies user actions to the store ahead of the backend and undoes them on failure.
///
/// Sends are tracked by temporary id until the backend assigns the real one.
/// Edits, deletes and reactions keep an undo record; only one of them may be
/// in flight per message.
#[derive(Debug)]
pub struct OptimisticCoordinator {
    local_user: UserId,
    max_text_len: usize,
    sends: HashMap<MessageId, PendingSend>,
    mutations: HashMap<MessageId, PendingMutation>,
}

impl OptimisticCoordinator {
    pub fn new(local_user: UserId, max_text_len: usize) -> Self {
        Self {
            local_user,
            max_text_len,
            sends: HashMap::new(),
            mutations: HashMap::new(),
        }
    }

    pub fn in_flight(&self, message_id: &MessageId) -> bool {
        self.mutations.contains_key(message_id)
    }

    pub fn in_flight_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.mutations.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn attempts(&self, temp_id: &MessageId) -> Option<u32> {
        self.sends.get(temp_id).map(|send| send.attempts)
    }

    /// Inserts a `Pending` entry under a fresh temporary id.
    pub fn begin_send(
        &mut self,
        store: &mut MessageStore,
        content: MessageContent,
        created_at_unix_ms: u64,
    ) -> ChatResult<MessageId> {
        content
            .validate(self.max_text_len)
            .context(ValidationSnafu { stage: "begin-send" })?;

        let temp_id = MessageId::temporary();
        let message = Message::new(
            temp_id.clone(),
            store.conversation_id().clone(),
            self.local_user.clone(),
            content.clone(),
            created_at_unix_ms,
        );
        store.append(message);
        self.sends.insert(
            temp_id.clone(),
            PendingSend {
                content,
                attempts: 1,
            },
        );
        Ok(temp_id)
    }

    pub fn confirm_send(
        &mut self,
        store: &mut MessageStore,
        temp_id: &MessageId,
        confirmed: Message,
    ) -> Applied {
        self.sends.remove(temp_id);
        store.reconcile_optimistic(temp_id, confirmed)
    }

    /// Leaves the entry in place, flagged, so the user can retry or discard it.
    pub fn fail_send(
        &mut self,
        store: &mut MessageStore,
        temp_id: &MessageId,
        reason: impl Into<String>,
    ) -> Applied {
        if !self.sends.contains_key(temp_id) {
            return Applied::Unchanged;
        }
        store.mark_failed(temp_id, reason)
    }

    /// Moves a failed send back to `Pending` and hands out the content to resend.
    pub fn retry(
        &mut self,
        store: &mut MessageStore,
        temp_id: &MessageId,
    ) -> ChatResult<MessageContent> {
        self.ensure_failed(store, temp_id, "retry-send")?;
        let send = self.sends.get_mut(temp_id).context(ConflictSnafu {
            stage: "retry-send",
            message_id: temp_id.to_string(),
            details: "no send is recorded for this message".to_string(),
        })?;
        send.attempts += 1;
        let content = send.content.clone();
        store.mark_pending(temp_id);
        Ok(content)
    }

    pub fn discard(&mut self, store: &mut MessageStore, temp_id: &MessageId) -> ChatResult<()> {
        self.ensure_failed(store, temp_id, "discard-send")?;
        self.sends.remove(temp_id);
        store.remove(temp_id);
        Ok(())
    }

    /// Pairs the channel echo of our own message with the oldest matching send.
    ///
    /// Failed sends are candidates too: the echo proves the backend committed a
    /// send whose acknowledgement was lost. Returns the temporary id that was
    /// replaced, if any.
    pub fn match_echo(&mut self, store: &mut MessageStore, echoed: &Message) -> Option<MessageId> {
        if echoed.sender_id != self.local_user {
            return None;
        }

        let temp_id = self
            .sends
            .iter()
            .filter(|(temp_id, send)| {
                send.content == echoed.content
                    && matches!(
                        store.send_state(temp_id),
                        Some(SendState::Pending | SendState::Failed { .. })
                    )
            })
            .filter_map(|(temp_id, _)| {
                store
                    .get(temp_id)
                    .map(|message| (message.created_at_unix_ms, temp_id.clone()))
            })
            .min()
            .map(|(_, temp_id)| temp_id)?;

        self.sends.remove(&temp_id);
        store.reconcile_optimistic(&temp_id, echoed.clone());
        Some(temp_id)
    }

    pub fn begin_edit(
        &mut self,
        store: &mut MessageStore,
        message_id: &MessageId,
        content: MessageContent,
    ) -> ChatResult<()> {
        content
            .validate(self.max_text_len)
            .context(ValidationSnafu { stage: "begin-edit" })?;
        let previous = self.mutable_target(store, message_id, MutationKind::Edit)?;
        ensure!(
            previous.content.kind() == content.kind(),
            ConflictSnafu {
                stage: "begin-edit",
                message_id: message_id.to_string(),
                details: format!(
                    "cannot turn a {} message into a {}",
                    previous.content.kind().as_str(),
                    content.kind().as_str()
                ),
            }
        );

        store.apply_edit(message_id, content);
        self.record(message_id, MutationKind::Edit, Undo::Edit(previous));
        Ok(())
    }

    pub fn begin_delete(&mut self, store: &mut MessageStore, message_id: &MessageId) -> ChatResult<()> {
        let previous = self.mutable_target(store, message_id, MutationKind::Delete)?;
        store.apply_delete(message_id);
        self.record(message_id, MutationKind::Delete, Undo::Delete(previous));
        Ok(())
    }

    pub fn begin_react(
        &mut self,
        store: &mut MessageStore,
        message_id: &MessageId,
        emoji: &str,
    ) -> ChatResult<String> {
        reactions::validate_emoji(emoji).context(ValidationSnafu {
            stage: "begin-react",
        })?;
        let emoji = emoji.trim().to_string();
        let target = self.mutable_target(store, message_id, MutationKind::React)?;

        let event = ReactionEvent::Add(Reaction::new(
            message_id.clone(),
            self.local_user.clone(),
            emoji.clone(),
        ));
        store.apply_reaction_event(&event);
        let undo = Undo::OwnReaction(self.own_reaction(&target));
        self.record(message_id, MutationKind::React, undo);
        Ok(emoji)
    }

    pub fn begin_unreact(&mut self, store: &mut MessageStore, message_id: &MessageId) -> ChatResult<()> {
        let target = self.mutable_target(store, message_id, MutationKind::Unreact)?;
        store.apply_reaction_event(&ReactionEvent::Remove {
            message_id: message_id.clone(),
            user_id: self.local_user.clone(),
            emoji: None,
        });
        let undo = Undo::OwnReaction(self.own_reaction(&target));
        self.record(message_id, MutationKind::Unreact, undo);
        Ok(())
    }

    /// Drops the undo record once the backend accepted the change.
    pub fn settle(&mut self, message_id: &MessageId) -> Option<MutationKind> {
        self.mutations.remove(message_id).map(|pending| pending.kind)
    }

    /// Puts the store back the way it was before the failed mutation.
    pub fn rollback(&mut self, store: &mut MessageStore, message_id: &MessageId) -> Option<MutationKind> {
        let pending = self.mutations.remove(message_id)?;
        let applied = match pending.undo {
            Undo::Edit(previous) => store.restore(&previous),
            Undo::Delete(previous) => store.undo_delete(&previous),
            Undo::OwnReaction(Some(reaction)) => {
                store.apply_reaction_event(&ReactionEvent::Add(reaction))
            }
            Undo::OwnReaction(None) => store.apply_reaction_event(&ReactionEvent::Remove {
                message_id: message_id.clone(),
                user_id: self.local_user.clone(),
                emoji: None,
            }),
        };
        tracing::debug!(
            %message_id,
            kind = ?pending.kind,
            changed = applied.changed(),
            "rolled back optimistic mutation"
        );
        Some(pending.kind)
    }

    /// Forgets everything in flight; used when the conversation is torn down.
    pub fn clear(&mut self) {
        self.sends.clear();
        self.mutations.clear();
    }

    fn record(&mut self, message_id: &MessageId, kind: MutationKind, undo: Undo) {
        self.mutations
            .insert(message_id.clone(), PendingMutation { kind, undo });
    }

    fn own_reaction(&self, message: &Message) -> Option<Reaction> {
        message
            .reactions
            .iter()
            .find(|reaction| reaction.user_id == self.local_user)
            .cloned()
    }

    fn ensure_failed(
        &self,
        store: &MessageStore,
        temp_id: &MessageId,
        stage: &'static str,
    ) -> ChatResult<()> {
        ensure!(
            matches!(store.send_state(temp_id), Some(SendState::Failed { .. })),
            ConflictSnafu {
                stage,
                message_id: temp_id.to_string(),
                details: "only failed sends can be retried or discarded".to_string(),
            }
        );
        Ok(())
    }

    /// Returns a copy of the target after checking it may be changed right now.
    fn mutable_target(
        &self,
        store: &MessageStore,
        message_id: &MessageId,
        kind: MutationKind,
    ) -> ChatResult<Message> {
        let stage = kind.stage();
        let conflict = |details: &str| ConflictSnafu {
            stage,
            message_id: message_id.to_string(),
            details: details.to_string(),
        };

        ensure!(
            !self.in_flight(message_id),
            conflict("another change to this message is still in flight")
        );
        let message = store
            .get(message_id)
            .cloned()
            .context(conflict("message is not in the conversation"))?;
        ensure!(
            store.send_state(message_id) == Some(&SendState::Confirmed),
            conflict("message has not been confirmed by the backend yet")
        );
        ensure!(!message.deleted, conflict("message was deleted"));

        let authored_only = matches!(kind, MutationKind::Edit | MutationKind::Delete);
        ensure!(
            !authored_only || message.sender_id == self.local_user,
            conflict("only the author can change this message")
        );
        Ok(message)
    }
}
