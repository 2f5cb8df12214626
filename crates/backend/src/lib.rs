mod backend;
pub mod channel;
mod error;
mod memory;

pub use backend::{BoxFuture, ChatBackend};
pub use channel::{
    ChannelEvent, RawEnvelope, RawEvent, RawMessage, RawReaction, Subscription, make_subscription,
    normalize, normalize_message,
};
pub use error::{BackendError, BackendResult};
pub use memory::{MEMORY_BACKEND_ID, MemoryBackend, Operation};
