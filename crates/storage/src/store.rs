use std::collections::HashMap;
use std::sync::Arc;

use super::delivery;
use super::ids::{ConversationId, MessageId, UserId};
use super::reactions;
use super::types::{
    Applied, Message, MessageBody, MessageContent, MessageView, ReactionEvent, SendState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    message: Message,
    send_state: SendState,
}

impl Entry {
    fn view(&self, local_user: &UserId) -> MessageView {
        let message = &self.message;
        let body = if message.deleted {
            MessageBody::Tombstone
        } else {
            MessageBody::Content(message.content.clone())
        };

        MessageView {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            body,
            created_at_unix_ms: message.created_at_unix_ms,
            edited: message.edited,
            send_state: self.send_state.clone(),
            delivery: delivery::resolve(message, &self.send_state, local_user),
            reactions: message.reactions.clone(),
            reaction_counts: reactions::summarize(&message.reactions, local_user),
        }
    }
}

/// Canonical ordered message list for one conversation.
///
/// Entries stay sorted by `(created_at, id)` after every mutation, and every
/// mutation is idempotent so redelivered events are harmless.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: ConversationId,
    local_user: UserId,
    entries: Vec<Entry>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation_id,
            local_user,
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.position(message_id)
            .map(|index| &self.entries[index].message)
    }

    pub fn send_state(&self, message_id: &MessageId) -> Option<&SendState> {
        self.position(message_id)
            .map(|index| &self.entries[index].send_state)
    }

    /// Inserts in order; a duplicate id is a no-op.
    ///
    /// Temporary ids enter as `Pending`, backend ids as `Confirmed`.
    pub fn append(&mut self, message: Message) -> Applied {
        if message.conversation_id != self.conversation_id {
            tracing::debug!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                "ignoring message addressed to another conversation"
            );
            return Applied::Unchanged;
        }

        if self.position(&message.id).is_some() {
            return Applied::Unchanged;
        }

        let send_state = if message.id.is_temporary() {
            SendState::Pending
        } else {
            SendState::Confirmed
        };
        self.insert_sorted(Entry {
            message,
            send_state,
        });
        Applied::Changed
    }

    /// Swaps a temporary entry for its confirmed counterpart.
    pub fn reconcile_optimistic(&mut self, temp_id: &MessageId, confirmed: Message) -> Applied {
        if self.position(&confirmed.id).is_some() {
            // The channel delivered the confirmed message before the send acknowledgement.
            return match self.position(temp_id) {
                Some(index) => {
                    self.entries.remove(index);
                    Applied::Changed
                }
                None => Applied::Unchanged,
            };
        }

        let Some(index) = self.position(temp_id) else {
            return self.append(confirmed);
        };

        self.entries[index] = Entry {
            message: confirmed,
            send_state: SendState::Confirmed,
        };
        if !self.is_ordered_at(index) {
            let entry = self.entries.remove(index);
            self.insert_sorted(entry);
        }
        Applied::Changed
    }

    /// Replaces the payload and marks the message edited. Absent or deleted targets are ignored.
    pub fn apply_edit(&mut self, message_id: &MessageId, content: MessageContent) -> Applied {
        let Some(message) = self.live_message_mut(message_id, "edit") else {
            return Applied::Unchanged;
        };

        if message.edited && message.content == content {
            return Applied::Unchanged;
        }

        message.content = content;
        message.edited = true;
        Applied::Changed
    }

    /// Tombstones the message; the payload is kept but never exposed.
    pub fn apply_delete(&mut self, message_id: &MessageId) -> Applied {
        let Some(message) = self.message_mut(message_id, "delete") else {
            return Applied::Unchanged;
        };

        if message.deleted {
            return Applied::Unchanged;
        }
        message.deleted = true;
        Applied::Changed
    }

    pub fn apply_reaction_event(&mut self, event: &ReactionEvent) -> Applied {
        let Some(message) = self.message_mut(event.message_id(), "reaction") else {
            return Applied::Unchanged;
        };

        let next = reactions::fold(&message.reactions, event);
        if next == message.reactions {
            return Applied::Unchanged;
        }
        message.reactions = next;
        Applied::Changed
    }

    /// Later timestamps win; earlier or equal ones are ignored.
    pub fn apply_read_receipt(&mut self, message_id: &MessageId, read_at_unix_ms: u64) -> Applied {
        let Some(message) = self.message_mut(message_id, "read-receipt") else {
            return Applied::Unchanged;
        };
        Applied::from_changed(advance(&mut message.read_at_unix_ms, read_at_unix_ms))
    }

    pub fn apply_delivery(&mut self, message_id: &MessageId, delivered_at_unix_ms: u64) -> Applied {
        let Some(message) = self.message_mut(message_id, "delivery") else {
            return Applied::Unchanged;
        };
        Applied::from_changed(advance(
            &mut message.delivered_at_unix_ms,
            delivered_at_unix_ms,
        ))
    }

    /// `Pending -> Failed`. Entries in any other state are left alone.
    pub fn mark_failed(&mut self, message_id: &MessageId, reason: impl Into<String>) -> Applied {
        let Some(index) = self.position(message_id) else {
            return Applied::Unchanged;
        };
        let entry = &mut self.entries[index];
        if entry.send_state != SendState::Pending {
            return Applied::Unchanged;
        }
        entry.send_state = SendState::Failed {
            reason: reason.into(),
        };
        Applied::Changed
    }

    /// `Failed -> Pending`, used when a failed send is retried.
    pub fn mark_pending(&mut self, message_id: &MessageId) -> Applied {
        let Some(index) = self.position(message_id) else {
            return Applied::Unchanged;
        };
        let entry = &mut self.entries[index];
        if !matches!(entry.send_state, SendState::Failed { .. }) {
            return Applied::Unchanged;
        }
        entry.send_state = SendState::Pending;
        Applied::Changed
    }

    pub fn remove(&mut self, message_id: &MessageId) -> Applied {
        match self.position(message_id) {
            Some(index) => {
                self.entries.remove(index);
                Applied::Changed
            }
            None => Applied::Unchanged,
        }
    }

    /// Rolls content and the edited flag back to a captured copy.
    ///
    /// A tombstone is final: a message deleted meanwhile stays deleted. Reactions
    /// and receipts that arrived meanwhile are authoritative and stay.
    pub fn restore(&mut self, previous: &Message) -> Applied {
        let Some(message) = self.live_message_mut(&previous.id, "restore") else {
            return Applied::Unchanged;
        };
        if message.content == previous.content && message.edited == previous.edited {
            return Applied::Unchanged;
        }

        message.content = previous.content.clone();
        message.edited = previous.edited;
        Applied::Changed
    }

    /// Reverts a local delete the backend refused, bringing back the captured payload.
    pub fn undo_delete(&mut self, previous: &Message) -> Applied {
        let Some(index) = self.position(&previous.id) else {
            return Applied::Unchanged;
        };
        let message = &mut self.entries[index].message;
        if !message.deleted {
            return Applied::Unchanged;
        }

        message.deleted = previous.deleted;
        message.content = previous.content.clone();
        message.edited = previous.edited;
        Applied::from_changed(!previous.deleted)
    }

    /// Replaces confirmed entries with a full fetch while keeping local optimistic entries.
    pub fn resync(&mut self, fetched: Vec<Message>) -> Applied {
        let mut previous: HashMap<MessageId, Entry> = self
            .entries
            .drain(..)
            .map(|entry| (entry.message.id.clone(), entry))
            .collect();

        let mut next: Vec<Entry> = Vec::with_capacity(fetched.len());
        for mut message in fetched {
            if message.conversation_id != self.conversation_id || message.id.is_temporary() {
                continue;
            }
            if next.iter().any(|entry| entry.message.id == message.id) {
                continue;
            }
            if let Some(local) = previous.remove(&message.id) {
                message.read_at_unix_ms = message.read_at_unix_ms.max(local.message.read_at_unix_ms);
                message.delivered_at_unix_ms = message
                    .delivered_at_unix_ms
                    .max(local.message.delivered_at_unix_ms);
                // A tombstone is final even if the fetch predates the delete.
                message.deleted |= local.message.deleted;
            }
            next.push(Entry {
                message,
                send_state: SendState::Confirmed,
            });
        }

        next.extend(
            previous
                .into_values()
                .filter(|entry| entry.message.id.is_temporary()),
        );
        next.sort_by(|left, right| left.message.order_key().cmp(&right.message.order_key()));

        let changed = next != self.entries;
        self.entries = next;
        Applied::from_changed(changed)
    }

    /// Immutable, ordered view for rendering.
    pub fn snapshot(&self) -> Arc<[MessageView]> {
        self.entries
            .iter()
            .map(|entry| entry.view(&self.local_user))
            .collect()
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.message.id == message_id)
    }

    fn message_mut(&mut self, message_id: &MessageId, operation: &'static str) -> Option<&mut Message> {
        match self.position(message_id) {
            Some(index) => Some(&mut self.entries[index].message),
            None => {
                tracing::debug!(%message_id, operation, "target message not present, dropping");
                None
            }
        }
    }

    fn live_message_mut(
        &mut self,
        message_id: &MessageId,
        operation: &'static str,
    ) -> Option<&mut Message> {
        self.message_mut(message_id, operation)
            .filter(|message| !message.deleted)
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let index = self.entries.partition_point(|existing| {
            existing.message.order_key() < entry.message.order_key()
        });
        self.entries.insert(index, entry);
    }

    fn is_ordered_at(&self, index: usize) -> bool {
        let key = self.entries[index].message.order_key();
        let after_previous = index == 0 || self.entries[index - 1].message.order_key() < key;
        let before_next = self
            .entries
            .get(index + 1)
            .is_none_or(|next| key < next.message.order_key());
        after_previous && before_next
    }
}

fn advance(slot: &mut Option<u64>, candidate: u64) -> bool {
    match slot {
        Some(current) if *current >= candidate => false,
        _ => {
            *slot = Some(candidate);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryStatus, Reaction};

    fn conversation() -> ConversationId {
        ConversationId::parse("c-1").unwrap()
    }

    fn me() -> UserId {
        UserId::parse("me").unwrap()
    }

    fn them() -> UserId {
        UserId::parse("u2").unwrap()
    }

    fn id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    fn message(raw_id: &str, body: &str, created_at: u64) -> Message {
        Message::new(
            id(raw_id),
            conversation(),
            them(),
            MessageContent::text(body),
            created_at,
        )
    }

    fn own(message_id: MessageId, body: &str, created_at: u64) -> Message {
        Message::new(
            message_id,
            conversation(),
            me(),
            MessageContent::text(body),
            created_at,
        )
    }

    fn store() -> MessageStore {
        MessageStore::new(conversation(), me())
    }

    fn ids(store: &MessageStore) -> Vec<String> {
        store
            .snapshot()
            .iter()
            .map(|view| view.id.to_string())
            .collect()
    }

    #[test]
    fn snapshot_is_sorted_regardless_of_arrival_order() {
        let fixtures = [
            message("a", "1", 10),
            message("b", "2", 20),
            message("c", "3", 30),
            message("d", "4", 40),
            message("e", "5", 50),
        ];
        let orders: [[usize; 5]; 4] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 0, 4, 1, 3],
            [3, 4, 0, 2, 1],
        ];

        for order in orders {
            let mut store = store();
            for index in order {
                store.append(fixtures[index].clone());
            }
            assert_eq!(ids(&store), vec!["a", "b", "c", "d", "e"], "order {order:?}");
        }
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let mut store = store();
        store.append(message("m-2", "second", 10));
        store.append(message("m-1", "first", 10));
        store.append(message("m-0", "earlier", 5));

        assert_eq!(ids(&store), vec!["m-0", "m-1", "m-2"]);
    }

    #[test]
    fn append_is_idempotent() {
        let mut store = store();
        assert_eq!(store.append(message("1", "hi", 10)), Applied::Changed);
        let once = store.snapshot();

        assert_eq!(store.append(message("1", "hi", 10)), Applied::Unchanged);
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_ignores_foreign_conversation() {
        let mut store = store();
        let mut foreign = message("1", "hi", 10);
        foreign.conversation_id = ConversationId::parse("c-9").unwrap();

        assert_eq!(store.append(foreign), Applied::Unchanged);
        assert!(store.is_empty());
    }

    #[test]
    fn edit_and_delete_are_idempotent() {
        let mut store = store();
        store.append(message("1", "hi", 10));

        assert!(store.apply_edit(&id("1"), MessageContent::text("hey")).changed());
        let after_edit = store.snapshot();
        assert!(!store.apply_edit(&id("1"), MessageContent::text("hey")).changed());
        assert_eq!(store.snapshot(), after_edit);
        assert!(after_edit[0].edited);

        assert!(store.apply_delete(&id("1")).changed());
        let after_delete = store.snapshot();
        assert!(!store.apply_delete(&id("1")).changed());
        assert_eq!(store.snapshot(), after_delete);
    }

    #[test]
    fn deleted_messages_are_tombstones_and_reject_edits() {
        let mut store = store();
        store.append(message("1", "secret", 10));
        store.apply_delete(&id("1"));

        let view = &store.snapshot()[0];
        assert_eq!(view.body, MessageBody::Tombstone);
        assert!(view.is_tombstone());
        // The payload is retained internally.
        assert_eq!(
            store.get(&id("1")).map(|message| &message.content),
            Some(&MessageContent::text("secret"))
        );

        assert!(!store.apply_edit(&id("1"), MessageContent::text("again")).changed());
    }

    #[test]
    fn mutations_on_unknown_messages_are_dropped() {
        let mut store = store();
        assert!(!store.apply_edit(&id("ghost"), MessageContent::text("x")).changed());
        assert!(!store.apply_delete(&id("ghost")).changed());
        assert!(!store.apply_read_receipt(&id("ghost"), 10).changed());
        assert!(
            !store
                .apply_reaction_event(&ReactionEvent::Add(Reaction::new(id("ghost"), them(), "👍")))
                .changed()
        );
        assert!(store.is_empty());
    }

    #[test]
    fn read_receipts_are_monotonic() {
        let mut store = store();
        store.append(own(id("m-1"), "hi", 10));

        assert!(store.apply_read_receipt(&id("m-1"), 200).changed());
        assert!(!store.apply_read_receipt(&id("m-1"), 100).changed());
        assert!(!store.apply_read_receipt(&id("m-1"), 200).changed());
        assert_eq!(
            store.get(&id("m-1")).and_then(|message| message.read_at_unix_ms),
            Some(200)
        );

        store.apply_delivery(&id("m-1"), 50);
        assert_eq!(store.snapshot()[0].delivery, Some(DeliveryStatus::Read));
    }

    #[test]
    fn delivery_status_never_reverts_after_read() {
        let mut store = store();
        store.append(own(id("m-1"), "hi", 10));
        store.apply_read_receipt(&id("m-1"), 300);

        // Stale refresh without receipts must not downgrade the status.
        store.resync(vec![own(id("m-1"), "hi", 10)]);
        store.apply_delivery(&id("m-1"), 100);
        store.apply_read_receipt(&id("m-1"), 50);

        assert_eq!(store.snapshot()[0].delivery, Some(DeliveryStatus::Read));
    }

    #[test]
    fn reconcile_replaces_temp_entry_in_place() {
        let mut store = store();
        store.append(message("a", "before", 10));
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "hello", 20));
        store.append(message("z", "after", 30));
        assert_eq!(store.send_state(&temp), Some(&SendState::Pending));

        store.reconcile_optimistic(&temp, own(id("m-42"), "hello", 20));

        assert_eq!(ids(&store), vec!["a", "m-42", "z"]);
        assert_eq!(store.send_state(&id("m-42")), Some(&SendState::Confirmed));
        assert!(store.get(&temp).is_none());
    }

    #[test]
    fn reconcile_resorts_when_server_timestamp_moves() {
        let mut store = store();
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "hello", 5));
        store.append(message("b", "other", 20));

        store.reconcile_optimistic(&temp, own(id("m-42"), "hello", 25));

        assert_eq!(ids(&store), vec!["b", "m-42"]);
    }

    #[test]
    fn reconcile_after_channel_delivery_leaves_single_entry() {
        let mut store = store();
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "hello", 20));
        store.append(own(id("m-42"), "hello", 21));

        assert!(store.reconcile_optimistic(&temp, own(id("m-42"), "hello", 21)).changed());
        assert_eq!(ids(&store), vec!["m-42"]);
        assert!(!store.reconcile_optimistic(&temp, own(id("m-42"), "hello", 21)).changed());
    }

    #[test]
    fn only_confirmed_sends_show_a_delivery_status() {
        let mut store = store();
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "hello", 20));
        assert_eq!(store.snapshot()[0].delivery, None);

        store.mark_failed(&temp, "offline");
        assert_eq!(store.snapshot()[0].delivery, None);

        store.reconcile_optimistic(&temp, own(id("m-42"), "hello", 21));
        assert_eq!(store.snapshot()[0].delivery, Some(DeliveryStatus::Sent));
    }

    #[test]
    fn reconcile_without_temp_entry_appends() {
        let mut store = store();
        store.reconcile_optimistic(&MessageId::temporary(), own(id("m-7"), "late", 10));
        assert_eq!(ids(&store), vec!["m-7"]);
    }

    #[test]
    fn failed_entries_can_be_retried_or_removed() {
        let mut store = store();
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "hello", 20));

        assert!(store.mark_failed(&temp, "offline").changed());
        assert_eq!(
            store.send_state(&temp),
            Some(&SendState::Failed {
                reason: "offline".to_string()
            })
        );
        assert!(!store.mark_failed(&temp, "offline").changed());

        assert!(store.mark_pending(&temp).changed());
        assert_eq!(store.send_state(&temp), Some(&SendState::Pending));

        store.mark_failed(&temp, "offline");
        assert!(store.remove(&temp).changed());
        assert!(store.is_empty());
    }

    #[test]
    fn resync_keeps_optimistic_entries_and_heals_gaps() {
        let mut store = store();
        store.append(message("1", "hi", 10));
        let temp = MessageId::temporary();
        store.append(own(temp.clone(), "pending", 40));

        // An edit that arrived before its message was dropped; the refresh carries it.
        store.apply_edit(&id("2"), MessageContent::text("edited"));
        let mut edited = message("2", "edited", 20);
        edited.edited = true;

        assert!(store.resync(vec![edited, message("1", "hi", 10), message("1", "hi", 10)]).changed());

        let snapshot = store.snapshot();
        assert_eq!(ids(&store), vec!["1".to_string(), "2".to_string(), temp.to_string()]);
        assert!(snapshot[1].edited);
        assert_eq!(snapshot[2].send_state, SendState::Pending);
    }

    #[test]
    fn restore_rolls_back_payload_only() {
        let mut store = store();
        store.append(own(id("m-1"), "original", 10));
        let before = store.get(&id("m-1")).cloned().unwrap();

        store.apply_edit(&id("m-1"), MessageContent::text("changed"));
        store.apply_read_receipt(&id("m-1"), 99);
        store.apply_reaction_event(&ReactionEvent::Add(Reaction::new(id("m-1"), them(), "👍")));
        assert!(store.restore(&before).changed());
        assert!(!store.restore(&before).changed());

        let restored = store.get(&id("m-1")).unwrap();
        assert_eq!(restored.content, MessageContent::text("original"));
        assert!(!restored.edited);
        assert_eq!(restored.read_at_unix_ms, Some(99));
        assert_eq!(restored.reactions.len(), 1);
    }

    #[test]
    fn restore_keeps_a_tombstone_that_arrived_meanwhile() {
        let mut store = store();
        store.append(own(id("m-1"), "secret", 10));
        let before = store.get(&id("m-1")).cloned().unwrap();

        store.apply_edit(&id("m-1"), MessageContent::text("less secret"));
        store.apply_delete(&id("m-1"));

        assert!(!store.restore(&before).changed());
        assert_eq!(store.snapshot()[0].body, MessageBody::Tombstone);
    }

    #[test]
    fn undo_delete_revives_the_captured_payload() {
        let mut store = store();
        store.append(own(id("m-1"), "keep me", 10));
        let before = store.get(&id("m-1")).cloned().unwrap();

        store.apply_delete(&id("m-1"));
        assert!(store.undo_delete(&before).changed());
        assert!(!store.undo_delete(&before).changed());
        assert_eq!(
            store.snapshot()[0].body,
            MessageBody::Content(MessageContent::text("keep me"))
        );
    }

    #[test]
    fn fetched_reaction_then_replacement_end_to_end() {
        let mut store = store();
        store.resync(vec![message("1", "hi", 0)]);

        store.apply_reaction_event(&ReactionEvent::Add(Reaction::new(id("1"), them(), "👍")));
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].reactions, vec![Reaction::new(id("1"), them(), "👍")]);

        store.apply_reaction_event(&ReactionEvent::Add(Reaction::new(id("1"), them(), "❤️")));
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].reactions, vec![Reaction::new(id("1"), them(), "❤️")]);
        assert_eq!(snapshot[0].reaction_counts.len(), 1);
        assert_eq!(snapshot[0].reaction_counts[0].count, 1);
    }

    #[test]
    fn snapshots_are_detached_from_later_mutations() {
        let mut store = store();
        store.append(message("1", "hi", 10));
        let before = store.snapshot();

        store.apply_edit(&id("1"), MessageContent::text("changed"));

        assert_eq!(before[0].body, MessageBody::Content(MessageContent::text("hi")));
    }
}
