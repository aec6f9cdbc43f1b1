//! Core data model shared by the store, runtime, and gateway crates:
//! identifiers, content blocks, configuration, and the `Message`/
//! `Conversation` entities (§3).

pub mod config;
pub mod content;
pub mod error;
pub mod ids;
pub mod message;

pub use content::{Content, ErrorKind, Role, StopReason, Usage};
pub use error::{CoreError, Result};
pub use ids::{ConversationId, MessageId, SequenceId, ToolUseId};
pub use message::{Conversation, Message, MessageType};
