use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::error::{InvalidContentSnafu, StoreResult};
use super::ids::{ConversationId, MessageId, UserId};

/// Upper bound on text bodies when no configured limit is supplied.
pub const DEFAULT_MAX_TEXT_LEN: usize = 4_000;

/// One 1:1 channel between the local user and a counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub counterpart_id: UserId,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub archived: bool,
}

impl Conversation {
    pub fn new(id: ConversationId, counterpart_id: UserId) -> Self {
        Self {
            id,
            counterpart_id,
            muted: false,
            archived: false,
        }
    }
}

/// Type tag sent alongside content on `send_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Text,
    Sticker,
    ActivityShare,
    AchievementShare,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Sticker => "sticker",
            Self::ActivityShare => "activity-share",
            Self::AchievementShare => "achievement-share",
        }
    }
}

/// Closed set of payloads a message can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageContent {
    Text { body: String },
    Sticker { token: String },
    ActivityShare { activity_id: String, title: String },
    AchievementShare { achievement_id: String, title: String },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn sticker(token: impl Into<String>) -> Self {
        Self::Sticker {
            token: token.into(),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Sticker { .. } => ContentKind::Sticker,
            Self::ActivityShare { .. } => ContentKind::ActivityShare,
            Self::AchievementShare { .. } => ContentKind::AchievementShare,
        }
    }

    /// Rejects empty payloads and text longer than `max_text_len` characters.
    pub fn validate(&self, max_text_len: usize) -> StoreResult<()> {
        match self {
            Self::Text { body } => {
                ensure!(
                    !body.trim().is_empty(),
                    InvalidContentSnafu {
                        stage: "validate-text",
                        details: "text body is empty".to_string(),
                    }
                );
                let length = body.chars().count();
                ensure!(
                    length <= max_text_len,
                    InvalidContentSnafu {
                        stage: "validate-text",
                        details: format!("text body has {length} characters, limit is {max_text_len}"),
                    }
                );
            }
            Self::Sticker { token } => ensure!(
                !token.trim().is_empty(),
                InvalidContentSnafu {
                    stage: "validate-sticker",
                    details: "sticker token is empty".to_string(),
                }
            ),
            Self::ActivityShare { activity_id, .. } => ensure!(
                !activity_id.trim().is_empty(),
                InvalidContentSnafu {
                    stage: "validate-activity-share",
                    details: "activity reference is empty".to_string(),
                }
            ),
            Self::AchievementShare { achievement_id, .. } => ensure!(
                !achievement_id.trim().is_empty(),
                InvalidContentSnafu {
                    stage: "validate-achievement-share",
                    details: "achievement reference is empty".to_string(),
                }
            ),
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

impl Reaction {
    pub fn new(message_id: MessageId, user_id: UserId, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
        }
    }
}

/// Add/remove input folded by the reaction aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEvent {
    Add(Reaction),
    Remove {
        message_id: MessageId,
        user_id: UserId,
        // Some backends name the emoji being withdrawn; a mismatch means the event is stale.
        emoji: Option<String>,
    },
}

impl ReactionEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Add(reaction) => &reaction.message_id,
            Self::Remove { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub delivered_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub read_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        created_at_unix_ms: u64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content,
            created_at_unix_ms,
            edited: false,
            deleted: false,
            delivered_at_unix_ms: None,
            read_at_unix_ms: None,
            reactions: Vec::new(),
        }
    }

    /// Total order within a conversation: creation time, then id.
    pub fn order_key(&self) -> (u64, &MessageId) {
        (self.created_at_unix_ms, &self.id)
    }
}

/// Local lifecycle of a stored entry, kept beside the message rather than on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    Confirmed,
    Pending,
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// What readers see in place of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Content(MessageContent),
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
}

/// Read-only projection of one stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at_unix_ms: u64,
    pub edited: bool,
    pub send_state: SendState,
    pub delivery: Option<DeliveryStatus>,
    pub reactions: Vec<Reaction>,
    pub reaction_counts: Vec<ReactionCount>,
}

impl MessageView {
    pub fn is_tombstone(&self) -> bool {
        matches!(self.body, MessageBody::Tombstone)
    }
}

/// Outcome of a store mutation, used to skip redundant snapshot publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

impl Applied {
    pub fn changed(self) -> bool {
        matches!(self, Self::Changed)
    }

    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_validation_bounds() {
        assert!(MessageContent::text("hello").validate(10).is_ok());
        assert!(MessageContent::text("   ").validate(10).is_err());
        assert!(MessageContent::text("x".repeat(11)).validate(10).is_err());
        // Limit counts characters, not bytes.
        assert!(MessageContent::text("é".repeat(10)).validate(10).is_ok());
    }

    #[test]
    fn content_kind_tags_match_wire_names() {
        let json = serde_json::to_value(MessageContent::sticker("wave")).unwrap();
        assert_eq!(json["type"], "sticker");
        assert_eq!(MessageContent::sticker("wave").kind().as_str(), "sticker");
        assert_eq!(
            MessageContent::ActivityShare {
                activity_id: "run-7".to_string(),
                title: "Morning run".to_string(),
            }
            .kind(),
            ContentKind::ActivityShare
        );
    }

    #[test]
    fn delivery_status_orders_by_progress() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }
}
