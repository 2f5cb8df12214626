use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, ReservedIdSnafu, StoreError, StoreResult};

/// Prefix reserved for client-minted message ids. Backend ids never carry it.
pub const TEMPORARY_ID_PREFIX: &str = "local:";

// Macro keeps all ID wrappers structurally identical, so boundary validation stays uniform.
macro_rules! define_entity_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> StoreResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-entity-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(raw: &str) -> StoreResult<Self> {
                Self::parse(raw)
            }
        }

        impl TryFrom<String> for $name {
            type Error = StoreError;

            fn try_from(raw: String) -> StoreResult<Self> {
                Self::parse(&raw)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_entity_id!(ConversationId, "conversation-id");
define_entity_id!(UserId, "user-id");
define_entity_id!(MessageId, "message-id");

impl MessageId {
    /// Mints a client-side id in the reserved temporary namespace.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Parses an id issued by the backend, rejecting the temporary namespace.
    pub fn parse_confirmed(raw: &str) -> StoreResult<Self> {
        let parsed = Self::parse(raw)?;
        ensure!(
            !parsed.is_temporary(),
            ReservedIdSnafu {
                stage: "parse-confirmed-message-id",
                raw: raw.to_string(),
            }
        );
        Ok(parsed)
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }
}
