#![deny(unsafe_code)]

/// Conversation engine: typing, optimistic changes, snapshot publication.
pub mod chat;
pub mod error;
/// Settings persistence.
pub mod settings;

pub use chat::{
    Action, ChatEngine, ChatHandle, ConversationSnapshot, EngineConfig, Notification,
};
pub use error::{ChatError, ChatResult, ErrorKind};
