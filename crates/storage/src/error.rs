use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("message id '{raw}' uses the reserved temporary namespace"))]
    ReservedId { stage: &'static str, raw: String },
    #[snafu(display("message content is invalid: {details}"))]
    InvalidContent {
        stage: &'static str,
        details: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
