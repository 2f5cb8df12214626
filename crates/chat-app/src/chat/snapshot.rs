use std::sync::Arc;

use arc_swap::ArcSwap;
use tandem_storage::{Conversation, ConversationId, MessageId, MessageView, UserId};
use tokio::sync::watch;

/// Everything the UI renders for the open conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    /// Bumped on every publish.
    pub version: u64,
    pub conversation_id: Option<ConversationId>,
    /// Metadata, present once the initial load finished.
    pub conversation: Option<Conversation>,
    pub loading: bool,
    pub messages: Arc<[MessageView]>,
    /// Messages with an edit, delete or reaction awaiting the backend.
    pub changing: Vec<MessageId>,
    pub typing_user_ids: Vec<UserId>,
}

impl ConversationSnapshot {
    pub fn is_open(&self) -> bool {
        self.conversation_id.is_some()
    }

    pub fn message(&self, message_id: &str) -> Option<&MessageView> {
        self.messages
            .iter()
            .find(|view| view.id.as_str() == message_id)
    }
}

/// Writer side: swaps in a new snapshot and wakes watchers.
pub(crate) struct SnapshotPublisher {
    current: Arc<ArcSwap<ConversationSnapshot>>,
    version: watch::Sender<u64>,
}

impl SnapshotPublisher {
    pub(crate) fn new() -> (Self, Arc<ArcSwap<ConversationSnapshot>>, watch::Receiver<u64>) {
        let current = Arc::new(ArcSwap::from_pointee(ConversationSnapshot::default()));
        let (version, updates) = watch::channel(0);
        let publisher = Self {
            current: Arc::clone(&current),
            version,
        };
        (publisher, current, updates)
    }

    pub(crate) fn publish(&self, mut snapshot: ConversationSnapshot) {
        let version = self.current.load().version + 1;
        snapshot.version = version;
        self.current.store(Arc::new(snapshot));
        self.version.send_replace(version);
    }
}
