use std::collections::HashMap;
use std::time::Duration;

use tandem_storage::{ConversationId, UserId};
use tokio::time::Instant;

/// Silence after which a typing signal lapses, on both halves.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Outbound transition for the local user's typing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypingSignal {
    Started,
    Stopped,
}

impl TypingSignal {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Debounced emitter for the local user's typing signal.
///
/// Each conversation owns at most one deadline. Input while active only pushes
/// the deadline out, so a burst of keystrokes yields one `Started` and one
/// `Stopped` after the quiet period.
#[derive(Debug)]
pub struct LocalTyping {
    timeout: Duration,
    deadlines: HashMap<ConversationId, Instant>,
}

impl LocalTyping {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadlines: HashMap::new(),
        }
    }

    pub fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.deadlines.contains_key(conversation_id)
    }

    pub fn on_input(&mut self, conversation_id: &ConversationId, now: Instant) -> Option<TypingSignal> {
        let previous = self
            .deadlines
            .insert(conversation_id.clone(), now + self.timeout);
        previous.is_none().then_some(TypingSignal::Started)
    }

    /// Clears the timer immediately, e.g. after a successful send or a conversation switch.
    pub fn stop(&mut self, conversation_id: &ConversationId) -> Option<TypingSignal> {
        self.deadlines
            .remove(conversation_id)
            .map(|_| TypingSignal::Stopped)
    }

    /// Conversations whose quiet period has elapsed; each is emitted once.
    pub fn expire(&mut self, now: Instant) -> Vec<ConversationId> {
        let expired: Vec<ConversationId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(conversation_id, _)| conversation_id.clone())
            .collect();
        for conversation_id in &expired {
            self.deadlines.remove(conversation_id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }
}

/// Who else is typing, per conversation, with silent expiry.
///
/// Entries lapse after the timeout even if the stop signal never arrives.
#[derive(Debug)]
pub struct RemoteTyping {
    timeout: Duration,
    last_seen: HashMap<ConversationId, HashMap<UserId, Instant>>,
}

impl RemoteTyping {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
        }
    }

    /// Records or refreshes a typing signal. Returns true when the user was not already shown.
    pub fn observe(&mut self, conversation_id: &ConversationId, user_id: &UserId, now: Instant) -> bool {
        let previous = self
            .last_seen
            .entry(conversation_id.clone())
            .or_default()
            .insert(user_id.clone(), now);
        previous.is_none_or(|seen| !self.is_live(seen, now))
    }

    pub fn stop(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(users) = self.last_seen.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.last_seen.remove(conversation_id);
        }
        removed
    }

    /// Live typists, sorted for stable rendering.
    pub fn typing_users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .last_seen
            .get(conversation_id)
            .into_iter()
            .flat_map(|users| users.iter())
            .filter(|(_, seen)| self.is_live(**seen, now))
            .map(|(user_id, _)| user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Drops lapsed entries. Returns true when anything was removed.
    pub fn prune(&mut self, now: Instant) -> bool {
        let timeout = self.timeout;
        let mut removed = false;
        self.last_seen.retain(|_, users| {
            let before = users.len();
            users.retain(|_, seen| now < *seen + timeout);
            removed |= users.len() != before;
            !users.is_empty()
        });
        removed
    }

    /// Earliest instant at which a live entry lapses.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.last_seen
            .values()
            .flat_map(|users| users.values())
            .map(|seen| *seen + self.timeout)
            .min()
    }

    pub fn clear(&mut self, conversation_id: &ConversationId) {
        self.last_seen.remove(conversation_id);
    }

    fn is_live(&self, seen: Instant, now: Instant) -> bool {
        now < seen + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    #[test]
    fn burst_of_input_emits_one_start_and_one_stop() {
        let start = Instant::now();
        let mut typing = LocalTyping::new(DEFAULT_TYPING_TIMEOUT);
        let c1 = conversation("c-1");

        assert_eq!(typing.on_input(&c1, start), Some(TypingSignal::Started));
        assert_eq!(typing.on_input(&c1, start + Duration::from_millis(800)), None);
        assert_eq!(typing.on_input(&c1, start + Duration::from_millis(2_500)), None);

        // Debounce: the deadline moved with the last keystroke.
        assert!(typing.expire(start + Duration::from_millis(3_100)).is_empty());
        assert_eq!(
            typing.next_deadline(),
            Some(start + Duration::from_millis(5_500))
        );
        assert_eq!(typing.expire(start + Duration::from_millis(5_500)), vec![c1.clone()]);
        assert!(!typing.is_active(&c1));
        assert!(typing.expire(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn stop_clears_the_timer_once() {
        let now = Instant::now();
        let mut typing = LocalTyping::new(DEFAULT_TYPING_TIMEOUT);
        let c1 = conversation("c-1");

        typing.on_input(&c1, now);
        assert_eq!(typing.stop(&c1), Some(TypingSignal::Stopped));
        assert_eq!(typing.stop(&c1), None);
        assert_eq!(typing.next_deadline(), None);

        // The next keystroke starts a new burst.
        assert_eq!(typing.on_input(&c1, now), Some(TypingSignal::Started));
    }

    #[test]
    fn timers_are_independent_per_conversation() {
        let now = Instant::now();
        let mut typing = LocalTyping::new(DEFAULT_TYPING_TIMEOUT);

        typing.on_input(&conversation("c-1"), now);
        typing.on_input(&conversation("c-2"), now + Duration::from_secs(2));

        assert_eq!(
            typing.expire(now + Duration::from_secs(3)),
            vec![conversation("c-1")]
        );
        assert!(typing.is_active(&conversation("c-2")));
    }

    #[test]
    fn remote_entries_expire_without_stop_signal() {
        let now = Instant::now();
        let mut remote = RemoteTyping::new(DEFAULT_TYPING_TIMEOUT);
        let c1 = conversation("c-1");

        assert!(remote.observe(&c1, &user("u2"), now));
        assert!(!remote.observe(&c1, &user("u2"), now + Duration::from_secs(1)));
        remote.observe(&c1, &user("u3"), now + Duration::from_secs(2));

        assert_eq!(
            remote.typing_users(&c1, now + Duration::from_millis(3_500)),
            vec![user("u2"), user("u3")]
        );
        assert_eq!(
            remote.typing_users(&c1, now + Duration::from_secs(4)),
            vec![user("u3")]
        );
        assert!(remote.typing_users(&c1, now + Duration::from_secs(5)).is_empty());
        assert_eq!(remote.next_expiry(), Some(now + Duration::from_secs(4)));

        assert!(remote.prune(now + Duration::from_secs(5)));
        assert_eq!(remote.next_expiry(), None);
    }

    #[test]
    fn explicit_stop_and_clear() {
        let now = Instant::now();
        let mut remote = RemoteTyping::new(DEFAULT_TYPING_TIMEOUT);
        let c1 = conversation("c-1");
        let c2 = conversation("c-2");

        remote.observe(&c1, &user("u2"), now);
        remote.observe(&c2, &user("u2"), now);

        assert!(remote.stop(&c1, &user("u2")));
        assert!(!remote.stop(&c1, &user("u2")));
        assert!(remote.typing_users(&c1, now).is_empty());
        assert_eq!(remote.typing_users(&c2, now), vec![user("u2")]);

        remote.clear(&c2);
        assert!(remote.typing_users(&c2, now).is_empty());
    }

    #[test]
    fn lapsed_entry_reappears_as_new() {
        let now = Instant::now();
        let mut remote = RemoteTyping::new(DEFAULT_TYPING_TIMEOUT);
        let c1 = conversation("c-1");

        remote.observe(&c1, &user("u2"), now);
        assert!(remote.observe(&c1, &user("u2"), now + Duration::from_secs(10)));
    }
}
