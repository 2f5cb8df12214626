use tandem_backend::BackendResult;
use tandem_storage::{ConversationId, Message, MessageContent, MessageId};
use tokio::sync::oneshot;

use super::engine::LoadedConversation;
use super::optimistic::MutationKind;
use crate::error::{ChatError, ChatResult};

type Reply<T> = oneshot::Sender<ChatResult<T>>;

/// Requests from [`ChatHandle`](super::ChatHandle) to the engine task.
#[derive(Debug)]
pub(crate) enum Command {
    Open {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Send {
        content: MessageContent,
        reply: Reply<MessageId>,
    },
    Edit {
        message_id: MessageId,
        content: MessageContent,
        reply: Reply<()>,
    },
    Delete {
        message_id: MessageId,
        reply: Reply<()>,
    },
    React {
        message_id: MessageId,
        emoji: String,
        reply: Reply<()>,
    },
    Unreact {
        message_id: MessageId,
        reply: Reply<()>,
    },
    Retry {
        message_id: MessageId,
        reply: Reply<()>,
    },
    Discard {
        message_id: MessageId,
        reply: Reply<()>,
    },
    MarkRead {
        reply: Reply<()>,
    },
    Refresh {
        reply: Reply<()>,
    },
    /// `true` for a keystroke, `false` when the composer was cleared.
    Typing {
        active: bool,
    },
    Shutdown,
}

/// Result of a spawned remote call, tagged with the epoch it was issued in.
pub(crate) enum Completion {
    Opened {
        epoch: u64,
        result: BackendResult<LoadedConversation>,
    },
    Refreshed {
        epoch: u64,
        result: BackendResult<Vec<Message>>,
    },
    Sent {
        epoch: u64,
        temp_id: MessageId,
        result: BackendResult<Message>,
    },
    Mutated {
        epoch: u64,
        message_id: MessageId,
        kind: MutationKind,
        result: BackendResult<()>,
    },
    MarkedRead {
        epoch: u64,
        result: BackendResult<()>,
    },
    TypingSent {
        conversation_id: ConversationId,
        active: bool,
        result: BackendResult<()>,
    },
}

/// User-facing operation a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Send,
    Edit,
    Delete,
    React,
    Unreact,
    MarkRead,
    Refresh,
}

impl From<MutationKind> for Action {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Edit => Self::Edit,
            MutationKind::Delete => Self::Delete,
            MutationKind::React => Self::React,
            MutationKind::Unreact => Self::Unreact,
        }
    }
}

/// Recoverable failure reported after the UI call already returned.
#[derive(Debug)]
pub enum Notification {
    Failed {
        action: Action,
        target: Option<MessageId>,
        error: ChatError,
    },
}
