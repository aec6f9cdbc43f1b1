use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use shelley_core::{Conversation, ConversationId, Message, MessageId, MessageType, SequenceId};

use crate::error::{Result, StoreError};

/// Persistence boundary (§6.3). A trait so the runtime crate's tests can
/// swap in an in-memory fake without touching SQLite.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, conv: &Conversation) -> Result<()>;
    fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;
    fn touch_conversation(&self, id: ConversationId, cwd: Option<&str>, model: Option<&str>) -> Result<()>;

    /// Set a conversation's slug (written once, e.g. after the first turn
    /// names itself) — the one `Conversation` field `touch_conversation`
    /// never updates (§6.3).
    fn update_conversation_slug(&self, id: ConversationId, slug: &str) -> Result<()>;

    /// Append a message, atomically assigning its `sequence_id` within the
    /// conversation (invariant 5, §3; §6.3). Returns the message with the
    /// assigned sequence.
    fn append_message(&self, message: Message) -> Result<Message>;

    /// Ordered messages for a conversation, ascending by sequence.
    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Messages appended after `after`, ascending by sequence — used by the
    /// Subscriber Bus replay path (§4.7).
    fn list_messages_since(&self, conversation_id: ConversationId, after: SequenceId) -> Result<Vec<Message>>;

    /// Most recently appended message in a conversation, if any (§6.3
    /// "get-latest-by-conversation").
    fn get_latest_message(&self, conversation_id: ConversationId) -> Result<Option<Message>>;

    /// Update a message's `user_data` — the one field a persisted, otherwise
    /// append-only message may ever have mutated (§3 Message).
    fn update_message_user_data(&self, id: MessageId, user_data: serde_json::Value) -> Result<()>;
}

/// SQLite-backed store, following the teacher's `Mutex<Connection>` pattern
/// (`skynet-memory::MemoryManager`, `skynet-sessions::SessionManager`) rather
/// than a connection pool — write volume per conversation is low and every
/// call is a handful of short, indexed queries.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(crate::db::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl ConversationStore for SqliteStore {
    fn create_conversation(&self, conv: &Conversation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations (id, slug, parent_id, cwd, model, user_initiated, next_sequence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                conv.id.to_string(),
                conv.slug,
                conv.parent.map(|p| p.to_string()),
                conv.cwd,
                conv.model,
                conv.user_initiated as i64,
                conv.created_at.to_rfc3339(),
                conv.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, slug, parent_id, cwd, model, user_initiated, created_at, updated_at
             FROM conversations WHERE id = ?1",
            params![id.to_string()],
            row_to_conversation,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn touch_conversation(&self, id: ConversationId, cwd: Option<&str>, model: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE conversations SET
                cwd = COALESCE(?2, cwd),
                model = COALESCE(?3, model),
                updated_at = ?4
             WHERE id = ?1",
            params![id.to_string(), cwd, model, now],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    fn update_conversation_slug(&self, id: ConversationId, slug: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE conversations SET slug = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), slug, now],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    fn append_message(&self, mut message: Message) -> Result<Message> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let next_seq: i64 = tx.query_row(
            "SELECT next_sequence FROM conversations WHERE id = ?1",
            params![message.conversation_id.to_string()],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE conversations SET next_sequence = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                message.conversation_id.to_string(),
                next_seq + 1,
                Utc::now().to_rfc3339()
            ],
        )?;

        message.sequence_id = SequenceId(next_seq as u64);

        tx.execute(
            "INSERT INTO messages (
                id, conversation_id, sequence_id, message_type, role, content_json,
                display_payload_json, usage_json, error_kind, end_of_turn,
                excluded_from_context, user_data_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sequence_id.0 as i64,
                message_type_str(message.message_type),
                role_str(message.role),
                serde_json::to_string(&message.content)?,
                message
                    .display_payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                message.usage.as_ref().map(serde_json::to_string).transpose()?,
                message.error_kind.map(error_kind_str),
                message.end_of_turn as i64,
                message.excluded_from_context as i64,
                message.user_data.as_ref().map(serde_json::to_string).transpose()?,
                message.created_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(message)
    }

    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.list_messages_since(conversation_id, SequenceId::UNASSIGNED)
    }

    fn list_messages_since(&self, conversation_id: ConversationId, after: SequenceId) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, message_type, role, content_json,
                    display_payload_json, usage_json, error_kind, end_of_turn,
                    excluded_from_context, user_data_json, created_at
             FROM messages
             WHERE conversation_id = ?1 AND sequence_id > ?2
             ORDER BY sequence_id ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id.to_string(), after.0 as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn get_latest_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, conversation_id, sequence_id, message_type, role, content_json,
                    display_payload_json, usage_json, error_kind, end_of_turn,
                    excluded_from_context, user_data_json, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY sequence_id DESC
             LIMIT 1",
            params![conversation_id.to_string()],
            row_to_message,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn update_message_user_data(&self, id: MessageId, user_data: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE messages SET user_data_json = ?2 WHERE id = ?1",
            params![id.to_string(), serde_json::to_string(&user_data)?],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let parent_id: Option<String> = row.get(2)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Conversation {
        id: parse_conversation_id(&id),
        slug: row.get(1)?,
        parent: parent_id.map(|p| parse_conversation_id(&p)),
        cwd: row.get(3)?,
        model: row.get(4)?,
        user_initiated: row.get::<_, i64>(5)? != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sequence_id: i64 = row.get(2)?;
    let message_type: String = row.get(3)?;
    let role: String = row.get(4)?;
    let content_json: String = row.get(5)?;
    let display_payload_json: Option<String> = row.get(6)?;
    let usage_json: Option<String> = row.get(7)?;
    let error_kind: Option<String> = row.get(8)?;
    let end_of_turn: i64 = row.get(9)?;
    let excluded_from_context: i64 = row.get(10)?;
    let user_data_json: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;

    Ok(Message {
        id: MessageId(uuid::Uuid::parse_str(&id).unwrap_or_else(|_| uuid::Uuid::nil())),
        conversation_id: parse_conversation_id(&conversation_id),
        sequence_id: SequenceId(sequence_id as u64),
        message_type: parse_message_type(&message_type),
        role: parse_role(&role),
        content: serde_json::from_str(&content_json).unwrap_or_default(),
        display_payload: display_payload_json.and_then(|s| serde_json::from_str(&s).ok()),
        usage: usage_json.and_then(|s| serde_json::from_str(&s).ok()),
        error_kind: error_kind.and_then(|s| parse_error_kind(&s)),
        end_of_turn: end_of_turn != 0,
        excluded_from_context: excluded_from_context != 0,
        user_data: user_data_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_timestamp(&created_at),
    })
}

fn parse_conversation_id(s: &str) -> ConversationId {
    ConversationId(uuid::Uuid::parse_str(s).unwrap_or_else(|_| uuid::Uuid::nil()))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn message_type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::User => "user",
        MessageType::Agent => "agent",
        MessageType::Tool => "tool",
        MessageType::System => "system",
        MessageType::GitInfo => "gitinfo",
        MessageType::Error => "error",
    }
}

fn parse_message_type(s: &str) -> MessageType {
    match s {
        "agent" => MessageType::Agent,
        "tool" => MessageType::Tool,
        "system" => MessageType::System,
        "gitinfo" => MessageType::GitInfo,
        "error" => MessageType::Error,
        _ => MessageType::User,
    }
}

fn role_str(r: shelley_core::Role) -> &'static str {
    match r {
        shelley_core::Role::User => "user",
        shelley_core::Role::Assistant => "assistant",
    }
}

fn parse_role(s: &str) -> shelley_core::Role {
    match s {
        "assistant" => shelley_core::Role::Assistant,
        _ => shelley_core::Role::User,
    }
}

fn error_kind_str(k: shelley_core::ErrorKind) -> &'static str {
    use shelley_core::ErrorKind::*;
    match k {
        Truncation => "truncation",
        LlmRequest => "llm_request",
        ContextWindow => "context_window",
        ToolNotFound => "tool_not_found",
        ToolFailure => "tool_failure",
        ModelMismatch => "model_mismatch",
        Cancellation => "cancellation",
    }
}

fn parse_error_kind(s: &str) -> Option<shelley_core::ErrorKind> {
    use shelley_core::ErrorKind::*;
    Some(match s {
        "truncation" => Truncation,
        "llm_request" => LlmRequest,
        "context_window" => ContextWindow,
        "tool_not_found" => ToolNotFound,
        "tool_failure" => ToolFailure,
        "model_mismatch" => ModelMismatch,
        "cancellation" => Cancellation,
        _ => return None,
    })
}
