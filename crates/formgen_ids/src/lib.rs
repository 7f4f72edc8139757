//! Identifier newtypes shared by the form catalog, the publish journal and the CLI.
//!
//! Every identifier is a UUID stored in its canonical lowercase hyphenated
//! text form, which is also how it is persisted and bound in SQL.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when a string is not a valid identifier of the expected kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    kind: &'static str,
    message: String,
}

impl IdParseError {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Kind of identifier that failed to parse (e.g. "form ID").
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Parse and normalize to the canonical lowercase form.
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let uuid = Uuid::parse_str(value.trim())
                    .map_err(|e| IdParseError::new($label, e.to_string()))?;
                Ok(Self(uuid.hyphenated().to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight hex digits, for log lines and tables.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_uuid_id!(
    /// Identity of a form in the catalog.
    FormId,
    "form ID"
);
define_uuid_id!(
    /// Identity of one immutable version of a form.
    FormVersionId,
    "form version ID"
);
define_uuid_id!(
    /// One run of the publish state machine, as recorded in the journal.
    AttemptId,
    "publish attempt ID"
);
define_uuid_id!(
    /// Owner token of a per-form publish lease.
    LeaseId,
    "lease ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_to_lowercase() {
        let id = FormId::parse("  6F9619FF-8B86-D011-B42D-00CF4FC964FF ").unwrap();
        assert_eq!(id.as_str(), "6f9619ff-8b86-d011-b42d-00cf4fc964ff");
        assert_eq!(id.short(), "6f9619ff");
    }

    #[test]
    fn parse_rejects_garbage_with_kind() {
        let err = AttemptId::parse("not-a-uuid").unwrap_err();
        assert_eq!(err.kind(), "publish attempt ID");
        assert!(err.to_string().starts_with("Invalid publish attempt ID"));
    }

    #[test]
    fn new_ids_are_distinct_and_round_trip() {
        let a = LeaseId::new();
        let b = LeaseId::new();
        assert_ne!(a, b);
        let parsed: LeaseId = a.as_str().parse().unwrap();
        assert_eq!(parsed, a);
    }
}
