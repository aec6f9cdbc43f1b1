//! Sub-agent Runner (§4.5): spawns a child conversation, drives it to
//! completion (or cancellation), and folds its transcript into a compact
//! text summary for the caller's turn.

use std::sync::Arc;
use std::time::Duration;

use shelley_core::{Content, Conversation, Message, MessageType};
use shelley_store::ConversationStore;

use crate::error::{Result, RuntimeError};
use crate::index_queue::IndexQueue;
use crate::llm::LlmService;
use crate::manager::ConversationManager;
use crate::recorder::Recorder;
use crate::tool::Tool;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_TEXT_BYTES: usize = 2000;
const MAX_TOOL_PAYLOAD_BYTES: usize = 500;

pub struct SubagentRunner {
    store: Arc<dyn ConversationStore>,
    recorder: Arc<Recorder>,
    llm: Arc<dyn LlmService>,
    tools: Vec<Arc<dyn Tool>>,
    context_window_fraction: f64,
    max_depth: u32,
    provider_tag: String,
    index_queue: Arc<IndexQueue>,
    poll_interval: Duration,
}

impl SubagentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        recorder: Arc<Recorder>,
        llm: Arc<dyn LlmService>,
        tools: Vec<Arc<dyn Tool>>,
        context_window_fraction: f64,
        max_depth: u32,
        provider_tag: String,
        index_queue: Arc<IndexQueue>,
    ) -> Self {
        Self {
            store,
            recorder,
            llm,
            tools,
            context_window_fraction,
            max_depth,
            provider_tag,
            index_queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll cadence (test-support; production callers get the
    /// 500ms default).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create a child conversation under `caller`, submit `prompt` as its
    /// first message, and wait for it to finish. Returns `"cancelled"` if
    /// the caller's own turn is cancelled while the sub-agent is running
    /// (§4.5 step 3), otherwise the summarized transcript.
    pub async fn run(&self, caller: &ConversationManager, model_id: &str, prompt: String) -> Result<String> {
        if !caller.can_spawn_subagent() {
            return Err(RuntimeError::DepthExceeded {
                depth: caller.subagent_depth() + 1,
                max: caller.max_subagent_depth(),
            });
        }

        let conv = Conversation::new_subagent(caller.conversation_id(), caller.cwd(), Some(model_id.to_string()));
        self.store.create_conversation(&conv)?;

        let manager = ConversationManager::new(
            conv.id,
            self.store.clone(),
            self.recorder.clone(),
            self.llm.clone(),
            self.tools.clone(),
            self.context_window_fraction,
            caller.subagent_depth() + 1,
            self.max_depth,
            true,
            self.provider_tag.clone(),
            self.index_queue.clone(),
        );
        manager.accept_user_message(model_id, vec![Content::text(prompt)])?;

        let caller_cancel = caller.cancel_signal();
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if caller_cancel.is_cancelled() {
                manager.cancel()?;
                return Ok("cancelled".to_string());
            }
            if !manager.is_agent_working() {
                break;
            }
        }

        let messages = self.store.list_messages(conv.id)?;
        Ok(summarize_transcript(&messages))
    }
}

/// Build a compact transcript: one line per non-system message, text
/// capped at 2000 bytes, tool input/result payloads capped at 500 bytes,
/// each at a UTF-8 boundary, tool errors annotated `(error)` (§4.5 step 4).
fn summarize_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.message_type != MessageType::System)
        .filter_map(|m| {
            let line = summarize_content(&m.content);
            if line.is_empty() {
                None
            } else {
                Some(format!("{:?}: {}", m.role, line))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_content(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            Content::Text { text } => Some(truncate_utf8(text, MAX_TEXT_BYTES)),
            Content::Thinking { .. } | Content::RedactedThinking { .. } => None,
            Content::Image { .. } => Some("[image]".to_string()),
            Content::ToolUse { tool_name, tool_input, .. } => Some(format!(
                "[tool_use {}: {}]",
                tool_name,
                truncate_utf8(&tool_input.to_string(), MAX_TOOL_PAYLOAD_BYTES)
            )),
            Content::ToolResult { content, is_error, .. } => {
                let inner = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let truncated = truncate_utf8(&inner, MAX_TOOL_PAYLOAD_BYTES);
                Some(if *is_error {
                    format!("[tool_result (error): {truncated}]")
                } else {
                    format!("[tool_result: {truncated}]")
                })
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusRegistry;
    use crate::context::RequestContext;
    use crate::index_queue::NoopIndexer;
    use crate::llm::{ChatRequest, ChatResponse, ProviderError};
    use async_trait::async_trait;
    use shelley_core::{StopReason, Usage};
    use shelley_store::SqliteStore;

    struct EndTurnLlm(String);

    #[async_trait]
    impl LlmService for EndTurnLlm {
        async fn send(&self, _ctx: &RequestContext, _request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: vec![Content::text(self.0.clone())],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "mock".into(),
            })
        }
        fn token_context_window(&self) -> Option<u32> {
            None
        }
    }

    fn harness(reply: &str) -> (Arc<ConversationManager>, SubagentRunner) {
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let conv = Conversation::new_user_initiated(Some("/work".into()), None);
        store.create_conversation(&conv).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        let recorder = Arc::new(Recorder::new(store.clone(), buses));
        let llm: Arc<dyn LlmService> = Arc::new(EndTurnLlm(reply.to_string()));
        let index_queue = Arc::new(IndexQueue::new(Arc::new(NoopIndexer), 16));

        let caller = ConversationManager::new(
            conv.id, store.clone(), recorder.clone(), llm.clone(), vec![], 0.8, 0, 1, false, "mock".into(), index_queue.clone(),
        );
        let runner = SubagentRunner::new(store, recorder, llm, vec![], 0.8, 1, "mock".into(), index_queue).with_poll_interval(Duration::from_millis(5));
        (caller, runner)
    }

    #[tokio::test]
    async fn runs_subagent_to_completion_and_summarizes() {
        let (caller, runner) = harness("sub-agent result");
        let summary = runner.run(&caller, "model-a", "do the thing".into()).await.unwrap();
        assert!(summary.contains("sub-agent result"));
        assert!(summary.contains("do the thing"));
    }

    #[tokio::test]
    async fn refuses_when_depth_limit_reached() {
        let (caller, runner) = harness("irrelevant");
        // drain caller's own turn so is_agent_working settles, then simulate
        // depth already at the max by constructing a second caller at depth 1.
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let conv = Conversation::new_user_initiated(None, None);
        store.create_conversation(&conv).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        let recorder = Arc::new(Recorder::new(store.clone(), buses));
        let llm: Arc<dyn LlmService> = Arc::new(EndTurnLlm("x".into()));
        let index_queue = Arc::new(IndexQueue::new(Arc::new(NoopIndexer), 16));
        let deep_caller = ConversationManager::new(conv.id, store, recorder, llm, vec![], 0.8, 1, 1, true, "mock".into(), index_queue);

        let err = runner.run(&deep_caller, "model-a", "nested".into()).await.unwrap_err();
        assert_eq!(err.code(), "DEPTH_EXCEEDED");
        let _ = caller; // keep the first harness alive for drop-order clarity
    }

    #[test]
    fn truncates_on_a_utf8_boundary() {
        let s = "a".repeat(10) + "é";
        let truncated = truncate_utf8(&s, 11);
        assert!(truncated.is_char_boundary(truncated.len() - 1) || truncated.ends_with('…'));
    }

    #[test]
    fn tool_error_results_are_annotated() {
        let content = vec![Content::tool_result(shelley_core::ToolUseId::new("t1"), "boom", true)];
        let line = summarize_content(&content);
        assert!(line.contains("(error)"));
        assert!(line.contains("boom"));
    }
}
