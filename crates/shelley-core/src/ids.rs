//! Strongly-typed identifiers used throughout the conversation runtime.
//!
//! Keeping these as distinct newtypes (rather than passing raw `Uuid`/`String`
//! around) is what lets the compiler catch a `ConversationId` accidentally
//! passed where a `MessageId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
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

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(ConversationId);
uuid_id!(MessageId);

/// A `tool_use`/`tool_result` correlation ID. Providers mint these as opaque
/// strings (e.g. `"toolu_01A..."`), so unlike `ConversationId`/`MessageId`
/// this is not a UUID wrapper — it is whatever the LLM service handed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolUseId(pub String);

impl ToolUseId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for ToolUseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ToolUseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ToolUseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-conversation, strictly-increasing message ordering key (invariant 5, §3).
///
/// `0` is reserved as "unassigned" — the store allocates the real value
/// atomically when a message is appended (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl SequenceId {
    pub const UNASSIGNED: SequenceId = SequenceId(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_ids_are_unique() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn sequence_id_ordering() {
        let a = SequenceId(1);
        let b = a.next();
        assert!(b > a);
        assert_eq!(b, SequenceId(2));
    }

    #[test]
    fn tool_use_id_roundtrips_through_json() {
        let id = ToolUseId::new("toolu_01ABC");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"toolu_01ABC\"");
        let back: ToolUseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
