pub mod delivery;
pub mod error;
pub mod ids;
pub mod reactions;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use ids::{ConversationId, MessageId, TEMPORARY_ID_PREFIX, UserId};
pub use store::MessageStore;
pub use types::{
    Applied, ContentKind, Conversation, DEFAULT_MAX_TEXT_LEN, DeliveryStatus, Message, MessageBody,
    MessageContent, MessageView, Reaction, ReactionCount, ReactionEvent, SendState,
};
