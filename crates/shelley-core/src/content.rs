//! The LLM-shaped content model (§3 "LLM Content"): a tagged union rather
//! than a stringly-typed `kind` field, per the redesign hint in §9
//! ("Runtime type-tagging of Content").

use serde::{Deserialize, Serialize};

use crate::ids::ToolUseId;

/// Conversational role. Only `User` and `Assistant` ever reach the LLM;
/// `system`/`error`/`gitinfo` message types (§3 Message) are filtered out
/// before a request is built (invariant 1, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single content block. A user-role message may only contain
/// `Text`/`Image`/`ToolResult`; an assistant-role message may only contain
/// `Text`/`Thinking`/`RedactedThinking`/`ToolUse` (§3 invariant, enforced by
/// callers — the type itself is shared between both roles for simplicity,
/// matching how providers serialize it on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Thinking { text: String },
    RedactedThinking { data: String },
    ToolUse {
        id: ToolUseId,
        tool_name: String,
        tool_input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        content: Vec<Content>,
        is_error: bool,
        /// Optional UI-shaped payload carried alongside the LLM-shaped result.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        display_payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ended_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    Image { media_type: String, data: String },
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text { text: s.into() }
    }

    pub fn tool_use(id: ToolUseId, tool_name: impl Into<String>, tool_input: serde_json::Value) -> Self {
        Content::ToolUse {
            id,
            tool_name: tool_name.into(),
            tool_input,
        }
    }

    pub fn tool_result(tool_use_id: ToolUseId, text: impl Into<String>, is_error: bool) -> Self {
        Content::ToolResult {
            tool_use_id,
            content: vec![Content::text(text)],
            is_error,
            display_payload: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn as_tool_use_id(&self) -> Option<&ToolUseId> {
        match self {
            Content::ToolUse { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn as_tool_result_id(&self) -> Option<&ToolUseId> {
        match self {
            Content::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Content::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Content::ToolResult { .. })
    }
}

/// Why the LLM stopped generating. `ToolUse` drives the Turn Loop back into
/// tool execution (§4.1 step 7); every other variant ends the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Refusal,
}

/// Per-response token/cost accounting (§3 "Usage"). A monoid under
/// component-wise addition — see `testable property 3` in §8 and the `Add`
/// impl below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens + rhs.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens + rhs.cache_read_tokens,
            cost_usd: self.cost_usd + rhs.cost_usd,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Error taxonomy surfaced to clients as a typed field on agent messages (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Truncation,
    LlmRequest,
    ContextWindow,
    ToolNotFound,
    ToolFailure,
    ModelMismatch,
    Cancellation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_additive() {
        let a = Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        let b = Usage {
            input_tokens: 3,
            cost_usd: 0.02,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum.input_tokens, 13);
        assert_eq!(sum.output_tokens, 5);
        assert!((sum.cost_usd - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_split_matches_whole() {
        // Testable property 3 (§8): Sum(R1) + Sum(R2) == Sum(R1 ∪ R2)
        let whole = Usage {
            input_tokens: 100,
            output_tokens: 40,
            cache_creation_tokens: 5,
            cache_read_tokens: 2,
            cost_usd: 0.75,
        };
        let r1 = Usage {
            input_tokens: 60,
            output_tokens: 15,
            cache_creation_tokens: 5,
            cache_read_tokens: 0,
            cost_usd: 0.50,
        };
        let r2 = Usage {
            input_tokens: 40,
            output_tokens: 25,
            cache_creation_tokens: 0,
            cache_read_tokens: 2,
            cost_usd: 0.25,
        };
        assert_eq!(r1 + r2, whole);
    }

    #[test]
    fn content_helpers_roundtrip() {
        let id = ToolUseId::new("toolu_1");
        let c = Content::tool_result(id.clone(), "ok", false);
        assert_eq!(c.as_tool_result_id(), Some(&id));
        assert!(!c.is_tool_use());
        assert!(c.is_tool_result());
    }
}
