//! `Conversation` and `Message` — the two persistent entities of §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{Content, ErrorKind, Role, Usage};
use crate::ids::{ConversationId, MessageId, SequenceId};

/// A conversation record. Mutated only by the Recorder (timestamps, slug)
/// and by explicit cwd/model updates — never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub slug: Option<String>,
    pub parent: Option<ConversationId>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub user_initiated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new_user_initiated(cwd: Option<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            slug: None,
            parent: None,
            cwd,
            model,
            user_initiated: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Construct a child conversation for a sub-agent (§4.5 step 1):
    /// inherits the parent's cwd and model, is never user-initiated.
    pub fn new_subagent(parent: ConversationId, cwd: Option<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            slug: None,
            parent: Some(parent),
            cwd,
            model,
            user_initiated: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message classification (§3, §4.4 step 1). `Role` (above) only concerns
/// what goes to the LLM; `MessageType` is the broader persisted/streamed tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    Tool,
    System,
    GitInfo,
    Error,
}

/// A persisted message. Append-only: once recorded, only `user_data` may be
/// mutated (§3 Message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// `SequenceId::UNASSIGNED` until the store assigns the real value
    /// atomically on append (§6.3, invariant 5).
    pub sequence_id: SequenceId,
    pub message_type: MessageType,
    pub role: Role,
    pub content: Vec<Content>,
    /// Optional UI-shaped payload, distinct from the LLM-shaped `content`
    /// (§3: "optional UI-shaped display payload").
    pub display_payload: Option<serde_json::Value>,
    pub usage: Option<Usage>,
    pub error_kind: Option<ErrorKind>,
    /// Set together with `error_kind` on terminal/informational error
    /// messages — mirrors the Go source's `end_of_turn` field (§4.1, §4.4).
    pub end_of_turn: bool,
    pub excluded_from_context: bool,
    /// Free-form, mutable annotation surface — the only part of a recorded
    /// message allowed to change after the fact (e.g. distillation status
    /// upgrades).
    pub user_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an unpersisted user-role message. The store assigns
    /// `sequence_id` on append.
    pub fn user(conversation_id: ConversationId, content: Vec<Content>) -> Self {
        Self::new(conversation_id, MessageType::User, Role::User, content)
    }

    /// Build an unpersisted agent-role (assistant) message.
    pub fn agent(conversation_id: ConversationId, content: Vec<Content>) -> Self {
        Self::new(conversation_id, MessageType::Agent, Role::Assistant, content)
    }

    /// Build a terminal or informational error message (§7). `ContextWindow`
    /// is the only kind that is not `end_of_turn`.
    pub fn error(conversation_id: ConversationId, kind: ErrorKind, text: impl Into<String>) -> Self {
        let end_of_turn = !matches!(kind, ErrorKind::ContextWindow);
        let mut m = Self::new(
            conversation_id,
            MessageType::Error,
            Role::Assistant,
            vec![Content::text(text)],
        );
        m.error_kind = Some(kind);
        m.end_of_turn = end_of_turn;
        m
    }

    /// Synthesize the system message a Conversation Manager inserts on
    /// first hydration when none exists yet (§4.3 "Hydrate").
    pub fn system(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageType::System, Role::Assistant, vec![Content::text(text)])
    }

    pub fn gitinfo(conversation_id: ConversationId, payload: serde_json::Value) -> Self {
        let mut m = Self::new(conversation_id, MessageType::GitInfo, Role::Assistant, Vec::new());
        m.display_payload = Some(payload);
        m
    }

    /// Build the message that carries a turn's `ToolResult`s back to the
    /// LLM. Role stays `User` (that's what the LLM sees), but `Type` is
    /// classified as `Tool` since the content is all `ToolResult`s (§3, §4.4
    /// step 1: Type is derived from role/content/ErrorKind, not hardcoded).
    pub fn tool_result(conversation_id: ConversationId, content: Vec<Content>) -> Self {
        Self::new(conversation_id, MessageType::Tool, Role::User, content)
    }

    fn new(conversation_id: ConversationId, message_type: MessageType, role: Role, content: Vec<Content>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sequence_id: SequenceId::UNASSIGNED,
            message_type,
            role,
            content,
            display_payload: None,
            usage: None,
            error_kind: None,
            end_of_turn: false,
            excluded_from_context: false,
            user_data: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this message's LLM-shaped content may be submitted in a
    /// request (§3 invariant 6, §4.1 step 2).
    pub fn is_llm_eligible(&self) -> bool {
        !self.excluded_from_context
            && matches!(self.message_type, MessageType::User | MessageType::Agent | MessageType::Tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_messages_are_not_llm_eligible() {
        let conv = ConversationId::new();
        let mut m = Message::agent(conv, vec![Content::text("too long")]);
        m.excluded_from_context = true;
        assert!(!m.is_llm_eligible());
    }

    #[test]
    fn system_and_gitinfo_are_never_llm_eligible() {
        let conv = ConversationId::new();
        let git = Message::gitinfo(conv, serde_json::json!({"branch": "main"}));
        assert!(!git.is_llm_eligible());
    }

    #[test]
    fn tool_result_message_is_typed_tool_and_still_llm_eligible() {
        let conv = ConversationId::new();
        let m = Message::tool_result(conv, vec![Content::tool_result(crate::ids::ToolUseId::new("t1"), "ok", false)]);
        assert_eq!(m.message_type, MessageType::Tool);
        assert_eq!(m.role, Role::User);
        assert!(m.is_llm_eligible());
    }

    #[test]
    fn context_window_errors_do_not_end_the_turn() {
        let conv = ConversationId::new();
        let m = Message::error(conv, ErrorKind::ContextWindow, "80% full");
        assert!(!m.end_of_turn);
        let m2 = Message::error(conv, ErrorKind::Truncation, "gave up");
        assert!(m2.end_of_turn);
    }
}
