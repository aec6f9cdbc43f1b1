//! The Turn Loop (§4.1): drives one conversation's LLM<->tool cycle to
//! completion, enforcing the tool-call protocol and handling truncation,
//! retries, and context-window warnings.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use shelley_core::{Content, ConversationId, ErrorKind, Message, Role, StopReason, ToolUseId, Usage};
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::git::GitState;
use crate::llm::{ChatRequest, ChatResponse, LlmService, ProviderError, ToolDefinition};
use crate::protocol_repair::{self, HistoryMessage};
use crate::recorder::Recorder;
use crate::tool::{Tool, ToolContext};

/// Defensive backstop against a runaway tool-call chain — not a named
/// invariant of the spec, just a cap on how many times one turn re-enters
/// the request/tool cycle, mirroring the teacher's `MAX_ITERATIONS` guard.
const MAX_CYCLE_ITERATIONS: usize = 50;

const PER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_LLM_RETRIES: u32 = 2;
const MAILBOX_POLL: Duration = Duration::from_millis(100);
const MAX_TRUNCATION_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
}

enum CycleOutcome {
    ToolUse,
    TurnEnded,
    Cancelled,
}

enum RetryOutcome {
    Cancelled,
    Terminal(ProviderError),
}

enum TruncationOutcome {
    Retry,
    Terminal,
}

enum ToolPhaseOutcome {
    Continued,
    Cancelled,
}

pub struct TurnLoop {
    llm: Arc<dyn LlmService>,
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Tool names in the order passed to `new`, so "the last tool" (§4.1
    /// step 2's cache hint) is deterministic rather than `HashMap` iteration
    /// order.
    tool_order: Vec<String>,
    recorder: Arc<Recorder>,
    system_prompt: Mutex<String>,
    mailbox: Mutex<VecDeque<Message>>,
    history: Mutex<Vec<Message>>,
    cumulative_usage: Mutex<Usage>,
    truncation_retries: AtomicU32,
    cwd: Mutex<Option<String>>,
    cancel_handles: DashMap<ToolUseId, CancellationToken>,
    context_window_fraction: f64,
    /// Last-known git state (§3 Turn State, §4.1 step 7), polled from `cwd`
    /// whenever a turn ends through the non-tool-use path.
    git_state: Mutex<GitState>,
}

impl TurnLoop {
    pub fn new(
        llm: Arc<dyn LlmService>,
        tools: Vec<Arc<dyn Tool>>,
        recorder: Arc<Recorder>,
        system_prompt: String,
        initial_history: Vec<Message>,
        context_window_fraction: f64,
    ) -> Self {
        let tool_order: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        let tools = tools.into_iter().map(|t| (t.name().to_string(), t)).collect();
        Self {
            llm,
            tools,
            tool_order,
            recorder,
            system_prompt: Mutex::new(system_prompt),
            mailbox: Mutex::new(VecDeque::new()),
            history: Mutex::new(initial_history),
            cumulative_usage: Mutex::new(Usage::default()),
            truncation_retries: AtomicU32::new(0),
            cwd: Mutex::new(None),
            cancel_handles: DashMap::new(),
            context_window_fraction,
            git_state: Mutex::new(GitState::default()),
        }
    }

    /// Non-blocking; appends to the mailbox (§4.1 "Enqueue").
    pub fn enqueue(&self, message: Message) {
        self.mailbox.lock().unwrap().push_back(message);
    }

    /// Defensive copy of in-memory history (§4.1 "History").
    pub fn history(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    pub fn cumulative_usage(&self) -> Usage {
        *self.cumulative_usage.lock().unwrap()
    }

    pub fn set_cwd(&self, cwd: Option<String>) {
        *self.cwd.lock().unwrap() = cwd;
    }

    pub fn cwd(&self) -> Option<String> {
        self.cwd.lock().unwrap().clone()
    }

    /// Cancel whatever tool is running under `id`, if any. Used by
    /// `CancelConversation` (§4.3) to target the in-flight tool.
    pub fn cancel_tool(&self, id: &ToolUseId) {
        if let Some(handle) = self.cancel_handles.get(id) {
            handle.cancel();
        }
    }

    fn drain_mailbox(&self) -> Vec<Message> {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.drain(..).collect()
    }

    fn append_history(&self, messages: impl IntoIterator<Item = Message>) {
        self.history.lock().unwrap().extend(messages);
    }

    fn add_usage(&self, usage: Usage) {
        *self.cumulative_usage.lock().unwrap() += usage;
    }

    fn record_and_cache(&self, ctx: &RequestContext, message: Message) -> Message {
        match self.recorder.record(ctx.conversation_id, message) {
            Ok(recorded) => {
                self.append_history(std::iter::once(recorded.clone()));
                recorded
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to record message");
                Message::error(ctx.conversation_id, ErrorKind::LlmRequest, "internal recording failure")
            }
        }
    }

    /// Drives turns until `ctx` is cancelled (§4.1 "Run").
    pub async fn run(&self, ctx: &RequestContext) -> TurnOutcome {
        loop {
            match self.run_one_turn(ctx).await {
                TurnOutcome::Cancelled => return TurnOutcome::Cancelled,
                TurnOutcome::Completed => continue,
            }
        }
    }

    /// Waits for the mailbox, then drives exactly one turn to completion
    /// (§4.1 "RunOneTurn" — control-flow steps 1 through 7).
    pub async fn run_one_turn(&self, ctx: &RequestContext) -> TurnOutcome {
        tracing::debug!(conversation_id = %ctx.conversation_id, "turn loop: waiting for mailbox");
        loop {
            let drained = self.drain_mailbox();
            if !drained.is_empty() {
                // Enqueued messages were already persisted by the caller
                // (`ConversationManager::accept_user_message` records before
                // enqueueing, precisely so the message shows up even while
                // the loop is mid-request) — just fold them into the cache.
                self.truncation_retries.store(0, Ordering::SeqCst);
                self.append_history(drained);
                break;
            }
            if ctx.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            tokio::select! {
                _ = tokio::time::sleep(MAILBOX_POLL) => continue,
                _ = ctx.cancel.cancelled() => return TurnOutcome::Cancelled,
            }
        }

        match self.drive_cycle(ctx).await {
            CycleOutcome::Cancelled => TurnOutcome::Cancelled,
            CycleOutcome::TurnEnded | CycleOutcome::ToolUse => TurnOutcome::Completed,
        }
    }

    async fn drive_cycle(&self, ctx: &RequestContext) -> CycleOutcome {
        for iteration in 0..MAX_CYCLE_ITERATIONS {
            tracing::debug!(conversation_id = %ctx.conversation_id, iteration, "turn loop: building request");
            if ctx.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            let request = self.build_request();
            let response = match self.send_with_retries(ctx, request).await {
                Ok(response) => response,
                Err(RetryOutcome::Cancelled) => return CycleOutcome::Cancelled,
                Err(RetryOutcome::Terminal(err)) => {
                    tracing::error!(conversation_id = %ctx.conversation_id, error = %err, "llm request failed terminally");
                    let mut msg = Message::error(ctx.conversation_id, ErrorKind::LlmRequest, format!("LLM request failed: {err}"));
                    msg.end_of_turn = true;
                    self.record_and_cache(ctx, msg);
                    return CycleOutcome::TurnEnded;
                }
            };

            self.add_usage(response.usage);

            if response.stop_reason == StopReason::MaxTokens {
                match self.handle_truncation(ctx, response) {
                    TruncationOutcome::Retry => continue,
                    TruncationOutcome::Terminal => return CycleOutcome::TurnEnded,
                }
            }

            let is_tool_use = response.stop_reason == StopReason::ToolUse;
            let mut assistant_msg = Message::agent(ctx.conversation_id, response.content);
            assistant_msg.usage = Some(response.usage);
            assistant_msg.end_of_turn = !is_tool_use;
            let recorded = self.record_and_cache(ctx, assistant_msg);

            self.maybe_warn_context_window(ctx);

            if is_tool_use {
                match self.execute_tools(ctx, &recorded).await {
                    ToolPhaseOutcome::Cancelled => return CycleOutcome::Cancelled,
                    ToolPhaseOutcome::Continued => continue,
                }
            } else {
                self.maybe_emit_gitinfo(ctx);
                return CycleOutcome::TurnEnded;
            }
        }

        tracing::error!(conversation_id = %ctx.conversation_id, "turn loop: exceeded max cycle iterations");
        let mut msg = Message::error(ctx.conversation_id, ErrorKind::LlmRequest, "turn aborted: too many tool iterations");
        msg.end_of_turn = true;
        self.record_and_cache(ctx, msg);
        CycleOutcome::TurnEnded
    }

    fn build_request(&self) -> ChatRequest {
        let history = self.history.lock().unwrap();
        let eligible: Vec<HistoryMessage> = history
            .iter()
            .filter(|m| m.is_llm_eligible())
            .map(|m| HistoryMessage::new(m.role, m.content.clone()))
            .collect();
        drop(history);

        let repaired = protocol_repair::repair(&eligible);
        let last_user_idx = repaired.iter().rposition(|hm| hm.role == shelley_core::Role::User);

        let messages = repaired
            .iter()
            .enumerate()
            .map(|(i, hm)| {
                let mut content: Vec<serde_json::Value> = hm
                    .content
                    .iter()
                    .map(|c| serde_json::to_value(c).unwrap_or(serde_json::Value::Null))
                    .collect();
                // §4.1 step 2: cache hint on the last content block of the
                // most recent user message.
                if Some(i) == last_user_idx {
                    if let Some(serde_json::Value::Object(block)) = content.last_mut() {
                        block.insert("cache_control".to_string(), serde_json::json!({"type": "ephemeral"}));
                    }
                }
                serde_json::json!({
                    "role": hm.role,
                    "content": content,
                })
            })
            .collect();

        let tool_count = self.tool_order.len();
        let tool_defs = self
            .tool_order
            .iter()
            .enumerate()
            .filter_map(|(i, name)| self.tools.get(name).map(|t| (i, t)))
            .map(|(i, t)| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                // §4.1 step 2: cache hint on the last tool, if it opts in.
                cache: i + 1 == tool_count && t.cache(),
            })
            .collect();

        ChatRequest {
            messages,
            tools: tool_defs,
            system: self.system_prompt.lock().unwrap().clone(),
            model: String::new(),
        }
    }

    async fn send_with_retries(&self, ctx: &RequestContext, request: ChatRequest) -> Result<ChatResponse, RetryOutcome> {
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=MAX_LLM_RETRIES {
            if ctx.is_cancelled() {
                return Err(RetryOutcome::Cancelled);
            }

            let send_fut = self.llm.send(ctx, request.clone());
            let outcome = tokio::select! {
                r = tokio::time::timeout(PER_REQUEST_TIMEOUT, send_fut) => r,
                _ = ctx.cancel.cancelled() => return Err(RetryOutcome::Cancelled),
            };

            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_elapsed) => ProviderError::Transport("i/o timeout".to_string()),
            };

            tracing::warn!(attempt, error = %err, "llm send failed");

            if err.is_retryable() && attempt < MAX_LLM_RETRIES {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                last_err = Some(err);
                continue;
            }
            return Err(RetryOutcome::Terminal(err));
        }

        Err(RetryOutcome::Terminal(
            last_err.unwrap_or_else(|| ProviderError::Transport("exhausted retries".to_string())),
        ))
    }

    fn handle_truncation(&self, ctx: &RequestContext, response: ChatResponse) -> TruncationOutcome {
        let mut truncated = Message::agent(ctx.conversation_id, response.content);
        truncated.usage = Some(response.usage);
        truncated.excluded_from_context = true;
        self.record_and_cache(ctx, truncated);

        let retries = self.truncation_retries.fetch_add(1, Ordering::SeqCst) + 1;
        if retries <= MAX_TRUNCATION_RETRIES {
            let placeholder = Message::agent(
                ctx.conversation_id,
                vec![Content::text("My response was too long; retrying more concisely.")],
            );
            self.record_and_cache(ctx, placeholder);
            let guidance = Message::user(
                ctx.conversation_id,
                vec![Content::text("Please respond more concisely; aim for a much shorter reply.")],
            );
            self.record_and_cache(ctx, guidance);
            TruncationOutcome::Retry
        } else {
            tracing::error!(conversation_id = %ctx.conversation_id, "truncation retries exhausted");
            let mut terminal = Message::error(
                ctx.conversation_id,
                ErrorKind::Truncation,
                "Response was truncated repeatedly and could not complete.",
            );
            terminal.end_of_turn = true;
            self.record_and_cache(ctx, terminal);
            TruncationOutcome::Terminal
        }
    }

    fn maybe_warn_context_window(&self, ctx: &RequestContext) {
        let Some(window) = self.llm.token_context_window() else {
            return;
        };
        let total = self.cumulative_usage().total_tokens();
        let threshold = (f64::from(window)) * self.context_window_fraction;
        if (total as f64) >= threshold {
            let pct = ((total as f64 / f64::from(window)) * 100.0).round();
            let msg = Message::error(
                ctx.conversation_id,
                ErrorKind::ContextWindow,
                format!("Context window is approximately {pct}% full."),
            );
            self.record_and_cache(ctx, msg);
        }
    }

    /// Poll git state from `cwd` and, if it changed since the last poll,
    /// record a `gitinfo` message (§3 Turn State, §4.1 step 7).
    fn maybe_emit_gitinfo(&self, ctx: &RequestContext) {
        let current = GitState::poll(self.cwd().as_deref());
        let mut last = self.git_state.lock().unwrap();
        if *last != current {
            let payload = current.to_payload();
            *last = current;
            drop(last);
            self.record_and_cache(ctx, Message::gitinfo(ctx.conversation_id, payload));
        }
    }

    async fn execute_tools(&self, ctx: &RequestContext, assistant_msg: &Message) -> ToolPhaseOutcome {
        let tool_uses: Vec<(ToolUseId, String, serde_json::Value)> = assistant_msg
            .content
            .iter()
            .filter_map(|c| match c {
                Content::ToolUse { id, tool_name, tool_input } => Some((id.clone(), tool_name.clone(), tool_input.clone())),
                _ => None,
            })
            .collect();

        let mut results = Vec::with_capacity(tool_uses.len());

        for (id, name, input) in tool_uses {
            tracing::debug!(tool = %name, tool_use_id = %id, "dispatching tool");

            let Some(tool) = self.tools.get(&name).cloned() else {
                results.push(Content::tool_result(id, format!("Tool '{name}' not found"), true));
                continue;
            };

            let handle = ctx.cancel.child_token();
            self.cancel_handles.insert(id.clone(), handle.clone());
            let mut tool_ctx_request = ctx.child();
            tool_ctx_request.cancel = handle;
            let tool_ctx = ToolContext {
                request: tool_ctx_request,
                cwd: self.cwd(),
            };

            let started_at = Utc::now();
            let run_fut = tool.run(&tool_ctx, input);
            let outcome = tokio::select! {
                out = run_fut => Some(out),
                _ = ctx.cancel.cancelled() => None,
            };
            self.cancel_handles.remove(&id);

            match outcome {
                // Cancellation cleanup (the one cancelled ToolResult plus
                // the terminal assistant message) is the Conversation
                // Manager's job (§4.3 "CancelConversation"), not the Loop's
                // — it inspects history for the orphan ToolUse afterward.
                None => return ToolPhaseOutcome::Cancelled,
                Some(out) => {
                    let ended_at = Utc::now();
                    let content = if let Some(err) = out.error {
                        Content::ToolResult {
                            tool_use_id: id,
                            content: vec![Content::text(err)],
                            is_error: true,
                            display_payload: out.display_payload,
                            started_at: Some(started_at),
                            ended_at: Some(ended_at),
                        }
                    } else {
                        Content::ToolResult {
                            tool_use_id: id,
                            content: out.content,
                            is_error: false,
                            display_payload: out.display_payload,
                            started_at: Some(started_at),
                            ended_at: Some(ended_at),
                        }
                    };
                    results.push(content);
                }
            }
        }

        self.record_and_cache(ctx, Message::tool_result(ctx.conversation_id, results));

        // Interruption contract (§4.1.1): messages queued during tool
        // execution were already recorded by the caller, same as the
        // initial mailbox drain — append them, don't re-record.
        self.append_history(self.drain_mailbox());

        ToolPhaseOutcome::Continued
    }
}
