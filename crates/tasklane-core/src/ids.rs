use crate::TasklaneError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^tx-[a-z0-9]{6,12}$").unwrap()
});

static WORKER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^worker-[a-z0-9]{8}$").unwrap()
});

static CLAIM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^claim-[a-z0-9]{8}$").unwrap()
});

/// Eight lowercase alphanumerics taken from a fresh v4 UUID.
fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

macro_rules! namespaced_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $re:ident, $entity:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, random_suffix()))
            }

            /// Validate and wrap an existing identifier.
            pub fn parse(raw: &str) -> Result<Self, TasklaneError> {
                if $re.is_match(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(TasklaneError::Validation(format!(
                        "invalid {} id '{}'",
                        $entity, raw
                    )))
                }
            }

            /// True when `raw` is a well-formed identifier.
            pub fn is_valid(raw: &str) -> bool {
                $re.is_match(raw)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = TasklaneError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = TasklaneError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if $re.is_match(&value) {
                    Ok(Self(value))
                } else {
                    Err(TasklaneError::Validation(format!(
                        "invalid {} id '{}'",
                        $entity, value
                    )))
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let raw = String::column_result(value)?;
                Self::try_from(raw)
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

namespaced_id!(
    /// Task identifier, `tx-` followed by 6 to 12 lowercase alphanumerics.
    TaskId,
    "tx-",
    TASK_ID_RE,
    "task"
);

namespaced_id!(
    /// Worker identifier, `worker-` followed by 8 lowercase alphanumerics.
    WorkerId,
    "worker-",
    WORKER_ID_RE,
    "worker"
);

namespaced_id!(
    /// Claim identifier, `claim-` followed by 8 lowercase alphanumerics.
    ClaimId,
    "claim-",
    CLAIM_ID_RE,
    "claim"
);
