//! The ambient context threaded through every public call into the core,
//! replacing thread-local/back-pointer state (§9 "Ambient context threading").

use std::time::{Duration, Instant};

use shelley_core::ConversationId;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub conversation_id: ConversationId,
    pub model_id: String,
    pub provider_tag: String,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(conversation_id: ConversationId, model_id: impl Into<String>, provider_tag: impl Into<String>) -> Self {
        Self {
            conversation_id,
            model_id: model_id.into(),
            provider_tag: provider_tag.into(),
            deadline: Instant::now() + Duration::from_secs(12 * 60 * 60),
            cancel: CancellationToken::new(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            conversation_id: self.conversation_id,
            model_id: self.model_id.clone(),
            provider_tag: self.provider_tag.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
