//! The `LLMService` boundary (§6.1). The core consumes this trait; concrete
//! provider adapters are out of scope — only `MockLlm` (test-support) ships.

use async_trait::async_trait;
use shelley_core::{Content, StopReason, Usage};
use thiserror::Error;

use crate::context::RequestContext;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
    pub system: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Set on the last tool of a request by the Turn Loop's request builder
    /// (§4.1 step 2) — providers that ignore it suffer no penalty.
    pub cache: bool,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Vec<Content>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request cancelled")]
    Cancelled,
}

/// Substrings the teacher's retry policy matches against (§6.1) —
/// independent of which concrete transport library raised the error.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "EOF",
    "unexpected EOF",
    "connection reset",
    "connection refused",
    "no such host",
    "network is unreachable",
    "i/o timeout",
];

impl ProviderError {
    /// Whether the Turn Loop (§4.1 step 3) should retry this failure.
    /// `RateLimited` and `Cancelled` are handled by their own paths and are
    /// never retried here.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(msg) => {
                RETRYABLE_SUBSTRINGS.iter().any(|needle| msg.contains(needle))
            }
            ProviderError::Api { .. } | ProviderError::Parse(_) => false,
            ProviderError::RateLimited { .. } | ProviderError::Cancelled => false,
        }
    }
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn send(&self, ctx: &RequestContext, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Model context window size in tokens; `None` means unknown, and the
    /// Turn Loop skips the context-window warning (§4.1 step 6, §6.1).
    fn token_context_window(&self) -> Option<u32>;

    /// For external image resizing; unused by this core but part of the
    /// declared interface (§6.1).
    fn max_image_dimension(&self) -> Option<u32> {
        None
    }
}
