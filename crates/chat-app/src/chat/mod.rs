mod engine;
mod events;
mod handle;
pub mod optimistic;
mod snapshot;
pub mod typing;

pub use engine::{ChatEngine, DEFAULT_REMOTE_CALL_TIMEOUT, EngineConfig};
pub use events::{Action, Notification};
pub use handle::ChatHandle;
pub use optimistic::{MutationKind, OptimisticCoordinator};
pub use snapshot::ConversationSnapshot;
pub use typing::{DEFAULT_TYPING_TIMEOUT, LocalTyping, RemoteTyping, TypingSignal};
