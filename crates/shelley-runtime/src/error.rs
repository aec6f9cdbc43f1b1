use shelley_core::ConversationId;
use thiserror::Error;

use crate::llm::ProviderError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] shelley_store::StoreError),

    #[error("core error: {0}")]
    Core(#[from] shelley_core::CoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("model mismatch: conversation is committed to '{committed}', got '{requested}'")]
    ModelMismatch { committed: String, requested: String },

    #[error("sub-agent depth limit exceeded: {depth} >= {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Store(_) => "STORE_ERROR",
            RuntimeError::Core(_) => "CORE_ERROR",
            RuntimeError::Provider(_) => "PROVIDER_ERROR",
            RuntimeError::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            RuntimeError::ModelMismatch { .. } => "MODEL_MISMATCH",
            RuntimeError::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            RuntimeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
