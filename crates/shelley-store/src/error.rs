use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            StoreError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
