//! The one `LlmService` implementation this crate ships (§1 scope):
//! a scripted test double, not a real provider adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use shelley_core::{Content, StopReason, Usage};

use crate::context::RequestContext;
use crate::llm::{ChatRequest, ChatResponse, LlmService, ProviderError};

/// Replays a queue of canned responses, one per `send` call. Exhausting the
/// queue is a test-authoring bug, surfaced as a terminal `Api` error rather
/// than a panic so a misconfigured scenario fails as a recorded message
/// instead of aborting the test process.
pub struct MockLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    context_window: Option<u32>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new(context_window: Option<u32>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            context_window,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_responses(context_window: Option<u32>, responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            context_window,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, response: ChatResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Build a simple end-turn text response, the shape most scenarios need.
pub fn end_turn(text: impl Into<String>) -> ChatResponse {
    ChatResponse {
        content: vec![Content::text(text)],
        stop_reason: StopReason::EndTurn,
        usage: Usage::default(),
        model: "mock".to_string(),
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn send(&self, _ctx: &RequestContext, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        responses.pop_front().ok_or_else(|| ProviderError::Api {
            status: 500,
            message: "MockLlm exhausted its scripted responses".to_string(),
        })
    }

    fn token_context_window(&self) -> Option<u32> {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_responses_in_order() {
        let mock = MockLlm::with_responses(None, vec![end_turn("first"), end_turn("second")]);
        let ctx = RequestContext::new(shelley_core::ConversationId::new(), "model-a", "mock");
        let request = ChatRequest {
            messages: vec![],
            tools: vec![],
            system: String::new(),
            model: "model-a".to_string(),
        };

        let first = mock.send(&ctx, request.clone()).await.unwrap();
        assert_eq!(first.content, vec![Content::text("first")]);
        let second = mock.send(&ctx, request).await.unwrap();
        assert_eq!(second.content, vec![Content::text("second")]);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_queue_is_a_terminal_error_not_a_panic() {
        let mock = MockLlm::new(None);
        let ctx = RequestContext::new(shelley_core::ConversationId::new(), "model-a", "mock");
        let request = ChatRequest {
            messages: vec![],
            tools: vec![],
            system: String::new(),
            model: "model-a".to_string(),
        };
        let err = mock.send(&ctx, request).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
