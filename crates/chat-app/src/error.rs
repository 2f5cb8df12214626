use snafu::Snafu;
use tandem_backend::BackendError;
use tandem_storage::StoreError;

/// Failure classes surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Conflict,
    Validation,
    Lifecycle,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("remote call failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("message '{message_id}' cannot be changed on `{stage}`: {details}"))]
    Conflict {
        stage: &'static str,
        message_id: String,
        details: String,
    },
    #[snafu(display("invalid input on `{stage}`, {source}"))]
    Validation {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("no conversation is open on `{stage}`"))]
    NoConversation { stage: &'static str },
    #[snafu(display("request on `{stage}` was superseded by a conversation switch"))]
    Superseded { stage: &'static str },
    #[snafu(display("chat engine stopped before `{stage}` completed"))]
    EngineStopped { stage: &'static str },
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NoConversation { .. } | Self::Superseded { .. } | Self::EngineStopped { .. } => {
                ErrorKind::Lifecycle
            }
        }
    }

    /// Maps a failed remote call, treating vanished targets as conflicts.
    pub(crate) fn from_backend(stage: &'static str, message_id: Option<&str>, source: BackendError) -> Self {
        match message_id {
            Some(message_id) if source.is_not_found() => Self::Conflict {
                stage,
                message_id: message_id.to_string(),
                details: source.to_string(),
            },
            _ => Self::Transport { stage, source },
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
