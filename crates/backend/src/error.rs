use snafu::Snafu;
use tandem_storage::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend unreachable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("backend rejected request on `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{entity} '{id}' is not addressable on `{stage}`"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("backend call `{stage}` timed out after {timeout_ms} ms"))]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("malformed channel event on `{stage}`: {details}"))]
    MalformedEvent {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("invalid identifier in channel event on `{stage}`, {source}"))]
    EventId {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to decode channel event on `{stage}`, {source}"))]
    DecodeEvent {
        stage: &'static str,
        source: serde_json::Error,
    },
}

impl BackendError {
    /// True when the target entity no longer exists or can no longer be changed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
