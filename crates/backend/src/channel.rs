use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    ConversationId, Message, MessageContent, MessageId, Reaction, ReactionEvent, UserId, reactions,
};
use tokio::sync::mpsc;

use super::error::{BackendResult, DecodeEventSnafu, EventIdSnafu, MalformedEventSnafu};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Reaction entry as carried inside a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawReaction {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
}

/// Message as delivered by the transport. Every field may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub edited: Option<bool>,
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub delivered_at: Option<u64>,
    #[serde(default)]
    pub read_at: Option<u64>,
    #[serde(default)]
    pub reactions: Option<Vec<RawReaction>>,
}

impl From<&Message> for RawMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.to_string()),
            conversation_id: Some(message.conversation_id.to_string()),
            sender_id: Some(message.sender_id.to_string()),
            content: Some(message.content.clone()),
            created_at: Some(message.created_at_unix_ms),
            edited: Some(message.edited),
            deleted: Some(message.deleted),
            delivered_at: message.delivered_at_unix_ms,
            read_at: message.read_at_unix_ms,
            reactions: Some(
                message
                    .reactions
                    .iter()
                    .map(|reaction| RawReaction {
                        user_id: Some(reaction.user_id.to_string()),
                        emoji: Some(reaction.emoji.clone()),
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawEvent {
    NewMessage {
        #[serde(default)]
        message: Option<RawMessage>,
    },
    MessageUpdate {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        content: Option<MessageContent>,
        #[serde(default)]
        deleted: Option<bool>,
        #[serde(default)]
        delivered_at: Option<u64>,
    },
    ReactionAdd {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        emoji: Option<String>,
    },
    ReactionRemove {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        emoji: Option<String>,
    },
    TypingSignal {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        typing: Option<bool>,
    },
    ReadReceipt {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        read_at: Option<u64>,
    },
}

/// One pushed event together with the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub event: RawEvent,
}

impl RawEnvelope {
    pub fn new(conversation_id: &ConversationId, event: RawEvent) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            event,
        }
    }

    pub fn from_json(payload: &str) -> BackendResult<Self> {
        serde_json::from_str(payload).context(DecodeEventSnafu {
            stage: "decode-envelope",
        })
    }
}

/// Validated event, safe to fold into engine state without further checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    NewMessage(Message),
    Edited {
        message_id: MessageId,
        content: MessageContent,
    },
    Deleted {
        message_id: MessageId,
    },
    Delivered {
        message_id: MessageId,
        delivered_at_unix_ms: u64,
    },
    Reaction(ReactionEvent),
    Typing {
        user_id: UserId,
        active: bool,
    },
    ReadReceipt {
        message_id: MessageId,
        read_at_unix_ms: u64,
    },
}

/// Validates one envelope for the subscribed conversation.
///
/// A `message-update` can carry several changes at once, so one envelope may
/// produce more than one event.
pub fn normalize(
    envelope: RawEnvelope,
    subscribed: &ConversationId,
) -> BackendResult<Vec<ChannelEvent>> {
    if let Some(raw) = envelope.conversation_id.as_deref() {
        let conversation_id = ConversationId::parse(raw).context(EventIdSnafu {
            stage: "normalize-envelope-conversation",
        })?;
        ensure!(
            &conversation_id == subscribed,
            MalformedEventSnafu {
                stage: "normalize-envelope-conversation",
                details: format!("event for '{conversation_id}' on channel for '{subscribed}'"),
            }
        );
    }

    let events = match envelope.event {
        RawEvent::NewMessage { message } => {
            let message = message.context(MalformedEventSnafu {
                stage: "normalize-new-message",
                details: "missing message body".to_string(),
            })?;
            vec![ChannelEvent::NewMessage(normalize_message(message, subscribed)?)]
        }
        RawEvent::MessageUpdate {
            message_id,
            content,
            deleted,
            delivered_at,
        } => {
            let message_id = required_message_id(message_id, "normalize-message-update")?;
            let mut events = Vec::new();
            if let Some(content) = content {
                events.push(ChannelEvent::Edited {
                    message_id: message_id.clone(),
                    content,
                });
            }
            if deleted == Some(true) {
                events.push(ChannelEvent::Deleted {
                    message_id: message_id.clone(),
                });
            }
            if let Some(delivered_at_unix_ms) = delivered_at {
                events.push(ChannelEvent::Delivered {
                    message_id,
                    delivered_at_unix_ms,
                });
            }
            ensure!(
                !events.is_empty(),
                MalformedEventSnafu {
                    stage: "normalize-message-update",
                    details: "update carries no change".to_string(),
                }
            );
            events
        }
        RawEvent::ReactionAdd {
            message_id,
            user_id,
            emoji,
        } => {
            let message_id = required_message_id(message_id, "normalize-reaction-add")?;
            let user_id = required_user_id(user_id, "normalize-reaction-add")?;
            let emoji = required_emoji(emoji, "normalize-reaction-add")?;
            vec![ChannelEvent::Reaction(ReactionEvent::Add(Reaction::new(
                message_id, user_id, emoji,
            )))]
        }
        RawEvent::ReactionRemove {
            message_id,
            user_id,
            emoji,
        } => {
            let message_id = required_message_id(message_id, "normalize-reaction-remove")?;
            let user_id = required_user_id(user_id, "normalize-reaction-remove")?;
            let emoji = emoji.filter(|emoji| !emoji.trim().is_empty());
            vec![ChannelEvent::Reaction(ReactionEvent::Remove {
                message_id,
                user_id,
                emoji,
            })]
        }
        RawEvent::TypingSignal { user_id, typing } => {
            let user_id = required_user_id(user_id, "normalize-typing-signal")?;
            vec![ChannelEvent::Typing {
                user_id,
                // A bare signal means the user is typing.
                active: typing.unwrap_or(true),
            }]
        }
        RawEvent::ReadReceipt {
            message_id,
            read_at,
        } => {
            let message_id = required_message_id(message_id, "normalize-read-receipt")?;
            let read_at_unix_ms = read_at.context(MalformedEventSnafu {
                stage: "normalize-read-receipt",
                details: "missing read_at".to_string(),
            })?;
            vec![ChannelEvent::ReadReceipt {
                message_id,
                read_at_unix_ms,
            }]
        }
    };

    Ok(events)
}

/// Converts a wire message into a fully populated domain message.
pub fn normalize_message(raw: RawMessage, subscribed: &ConversationId) -> BackendResult<Message> {
    let id = required_message_id(raw.id, "normalize-message")?;
    let conversation_id = match raw.conversation_id.as_deref() {
        Some(value) => ConversationId::parse(value).context(EventIdSnafu {
            stage: "normalize-message-conversation",
        })?,
        None => subscribed.clone(),
    };
    ensure!(
        &conversation_id == subscribed,
        MalformedEventSnafu {
            stage: "normalize-message-conversation",
            details: format!("message '{id}' belongs to '{conversation_id}'"),
        }
    );
    let sender_id = required_user_id(raw.sender_id, "normalize-message-sender")?;
    let content = raw.content.context(MalformedEventSnafu {
        stage: "normalize-message-content",
        details: format!("message '{id}' has no content"),
    })?;
    let created_at_unix_ms = raw.created_at.context(MalformedEventSnafu {
        stage: "normalize-message-created-at",
        details: format!("message '{id}' has no creation time"),
    })?;

    let mut message = Message::new(id, conversation_id, sender_id, content, created_at_unix_ms);
    message.edited = raw.edited.unwrap_or(false);
    message.deleted = raw.deleted.unwrap_or(false);
    message.delivered_at_unix_ms = raw.delivered_at;
    message.read_at_unix_ms = raw.read_at;

    // Route wire reactions through the aggregator so duplicates per user collapse.
    for entry in raw.reactions.unwrap_or_default() {
        let user_id = required_user_id(entry.user_id, "normalize-message-reaction")?;
        let emoji = required_emoji(entry.emoji, "normalize-message-reaction")?;
        let event = ReactionEvent::Add(Reaction::new(message.id.clone(), user_id, emoji));
        message.reactions = reactions::fold(&message.reactions, &event);
    }

    Ok(message)
}

fn required_message_id(raw: Option<String>, stage: &'static str) -> BackendResult<MessageId> {
    let raw = raw.context(MalformedEventSnafu {
        stage,
        details: "missing message id".to_string(),
    })?;
    MessageId::parse_confirmed(&raw).context(EventIdSnafu { stage })
}

fn required_user_id(raw: Option<String>, stage: &'static str) -> BackendResult<UserId> {
    let raw = raw.context(MalformedEventSnafu {
        stage,
        details: "missing user id".to_string(),
    })?;
    UserId::parse(&raw).context(EventIdSnafu { stage })
}

fn required_emoji(raw: Option<String>, stage: &'static str) -> BackendResult<String> {
    raw.map(|emoji| emoji.trim().to_string())
        .filter(|emoji| !emoji.is_empty())
        .context(MalformedEventSnafu {
            stage,
            details: "missing emoji".to_string(),
        })
}

/// Live registration on one conversation's event stream.
///
/// Teardown is explicit through [`Subscription::unsubscribe`], which is
/// idempotent; dropping the handle tears down as well. Once torn down,
/// `recv` yields `None` and no buffered event is delivered.
pub struct Subscription {
    id: u64,
    conversation_id: ConversationId,
    events: Option<mpsc::UnboundedReceiver<RawEnvelope>>,
    ready: VecDeque<ChannelEvent>,
}

impl Subscription {
    pub(crate) fn new(
        conversation_id: ConversationId,
        events: mpsc::UnboundedReceiver<RawEnvelope>,
    ) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            conversation_id,
            events: Some(events),
            ready: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.events.is_some()
    }

    /// Next validated event. Malformed envelopes are logged and skipped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }

            let envelope = self.events.as_mut()?.recv().await?;
            match normalize(envelope, &self.conversation_id) {
                Ok(events) => self.ready.extend(events),
                Err(error) => {
                    tracing::warn!(
                        subscription_id = self.id,
                        conversation_id = %self.conversation_id,
                        %error,
                        "dropping malformed channel event"
                    );
                }
            }
        }
    }

    /// Detaches from the stream. Returns `false` when already detached.
    pub fn unsubscribe(&mut self) -> bool {
        self.ready.clear();
        match self.events.take() {
            Some(mut events) => {
                events.close();
                tracing::debug!(
                    subscription_id = self.id,
                    conversation_id = %self.conversation_id,
                    "unsubscribed from conversation channel"
                );
                true
            }
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Creates the sender half kept by a backend and the handle given to the engine.
pub fn make_subscription(
    conversation_id: ConversationId,
) -> (mpsc::UnboundedSender<RawEnvelope>, Subscription) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (event_tx, Subscription::new(conversation_id, event_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendError;

    fn conversation() -> ConversationId {
        ConversationId::parse("c-1").unwrap()
    }

    fn raw_message(id: &str) -> RawMessage {
        RawMessage {
            id: Some(id.to_string()),
            conversation_id: Some("c-1".to_string()),
            sender_id: Some("u2".to_string()),
            content: Some(MessageContent::text("hi")),
            created_at: Some(1_000),
            ..RawMessage::default()
        }
    }

    #[test]
    fn decodes_and_normalizes_json_envelope() {
        let payload = r#"{
            "conversation_id": "c-1",
            "event": {"type": "reaction-add", "message_id": "1", "user_id": "u2", "emoji": "👍"}
        }"#;
        let envelope = RawEnvelope::from_json(payload).unwrap();
        let events = normalize(envelope, &conversation()).unwrap();

        assert_eq!(
            events,
            vec![ChannelEvent::Reaction(ReactionEvent::Add(Reaction::new(
                MessageId::parse("1").unwrap(),
                UserId::parse("u2").unwrap(),
                "👍",
            )))]
        );
    }

    #[test]
    fn new_message_fills_defaults_and_collapses_duplicate_reactions() {
        let mut raw = raw_message("m-1");
        raw.reactions = Some(vec![
            RawReaction {
                user_id: Some("u3".to_string()),
                emoji: Some("👍".to_string()),
            },
            RawReaction {
                user_id: Some("u3".to_string()),
                emoji: Some("🎉".to_string()),
            },
        ]);
        let envelope = RawEnvelope::new(&conversation(), RawEvent::NewMessage { message: Some(raw) });

        let events = normalize(envelope, &conversation()).unwrap();
        let [ChannelEvent::NewMessage(message)] = events.as_slice() else {
            panic!("expected one new-message event, got {events:?}");
        };
        assert!(!message.edited);
        assert!(!message.deleted);
        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions[0].emoji, "🎉");
    }

    #[test]
    fn message_update_splits_into_events() {
        let envelope = RawEnvelope::new(
            &conversation(),
            RawEvent::MessageUpdate {
                message_id: Some("m-1".to_string()),
                content: Some(MessageContent::text("edited")),
                deleted: Some(true),
                delivered_at: Some(5),
            },
        );

        let events = normalize(envelope, &conversation()).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ChannelEvent::Edited { .. }));
        assert!(matches!(events[1], ChannelEvent::Deleted { .. }));
        assert!(matches!(
            events[2],
            ChannelEvent::Delivered {
                delivered_at_unix_ms: 5,
                ..
            }
        ));
    }

    #[test]
    fn rejects_incomplete_and_foreign_events() {
        let missing_content = RawEnvelope::new(
            &conversation(),
            RawEvent::NewMessage {
                message: Some(RawMessage {
                    content: None,
                    ..raw_message("m-1")
                }),
            },
        );
        assert!(matches!(
            normalize(missing_content, &conversation()),
            Err(BackendError::MalformedEvent { .. })
        ));

        let empty_update = RawEnvelope::new(
            &conversation(),
            RawEvent::MessageUpdate {
                message_id: Some("m-1".to_string()),
                content: None,
                deleted: Some(false),
                delivered_at: None,
            },
        );
        assert!(normalize(empty_update, &conversation()).is_err());

        let foreign = RawEnvelope {
            conversation_id: Some("c-2".to_string()),
            event: RawEvent::TypingSignal {
                user_id: Some("u2".to_string()),
                typing: None,
            },
        };
        assert!(normalize(foreign, &conversation()).is_err());

        let reserved = RawEnvelope::new(
            &conversation(),
            RawEvent::ReadReceipt {
                message_id: Some("local:abc".to_string()),
                read_at: Some(1),
            },
        );
        assert!(matches!(
            normalize(reserved, &conversation()),
            Err(BackendError::EventId { .. })
        ));
    }

    #[tokio::test]
    async fn recv_skips_malformed_events() {
        let (sender, mut subscription) = make_subscription(conversation());
        sender
            .send(RawEnvelope::new(
                &conversation(),
                RawEvent::ReactionAdd {
                    message_id: Some("1".to_string()),
                    user_id: None,
                    emoji: Some("👍".to_string()),
                },
            ))
            .unwrap();
        sender
            .send(RawEnvelope::new(
                &conversation(),
                RawEvent::TypingSignal {
                    user_id: Some("u2".to_string()),
                    typing: None,
                },
            ))
            .unwrap();

        assert_eq!(
            subscription.recv().await,
            Some(ChannelEvent::Typing {
                user_id: UserId::parse("u2").unwrap(),
                active: true,
            })
        );
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let (sender, mut subscription) = make_subscription(conversation());
        sender
            .send(RawEnvelope::new(
                &conversation(),
                RawEvent::TypingSignal {
                    user_id: Some("u2".to_string()),
                    typing: Some(true),
                },
            ))
            .unwrap();

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert!(!subscription.is_active());
        assert!(sender.is_closed());
        assert_eq!(subscription.recv().await, None);
    }
}
