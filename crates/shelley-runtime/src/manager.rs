//! Conversation Manager (§4.3): the single-conversation facade. Exactly one
//! manager exists per active conversation, reused across requests, and kept
//! in a process-local table keyed by `ConversationId` (§9 "Cyclic
//! references" — modeled here as one-way hooks instead of back-pointers).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use shelley_core::{Content, Conversation, ConversationId, ErrorKind, Message, MessageType, ToolUseId};
use shelley_store::ConversationStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::RequestContext;
use crate::error::{Result, RuntimeError};
use crate::index_queue::IndexQueue;
use crate::llm::LlmService;
use crate::recorder::Recorder;
use crate::tool::Tool;
use crate::turn_loop::TurnLoop;

const DEFAULT_SYSTEM_PROMPT: &str = "You are Shelley, an autonomous coding assistant operating in a user's \
working directory. Use the available tools to read, edit, and run code; explain your \
reasoning briefly and prefer taking action over asking clarifying questions when the \
request is unambiguous.";

const SUBAGENT_SYSTEM_PROMPT: &str = "You are a sub-agent spawned to complete one focused task on behalf of \
another agent. Work autonomously, then report your result concisely; do not ask the user \
questions.";

pub struct ConversationManager {
    conversation_id: ConversationId,
    store: Arc<dyn ConversationStore>,
    recorder: Arc<Recorder>,
    llm: Arc<dyn LlmService>,
    tools: Vec<Arc<dyn Tool>>,
    context_window_fraction: f64,
    depth: u32,
    max_depth: u32,
    is_subagent: bool,
    provider_tag: String,
    index_queue: Arc<IndexQueue>,

    hydrated: AtomicBool,
    turn_loop: Mutex<Option<Arc<TurnLoop>>>,
    committed_model: Mutex<Option<String>>,
    cwd: Mutex<Option<String>>,
    agent_working: AtomicBool,
    working_tx: watch::Sender<bool>,
    running_ctx: Mutex<Option<RequestContext>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
}

impl ConversationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversation_id: ConversationId,
        store: Arc<dyn ConversationStore>,
        recorder: Arc<Recorder>,
        llm: Arc<dyn LlmService>,
        tools: Vec<Arc<dyn Tool>>,
        context_window_fraction: f64,
        depth: u32,
        max_depth: u32,
        is_subagent: bool,
        provider_tag: String,
        index_queue: Arc<IndexQueue>,
    ) -> Arc<Self> {
        let (working_tx, _working_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            conversation_id,
            store,
            recorder: recorder.clone(),
            llm,
            tools,
            context_window_fraction,
            depth,
            max_depth,
            is_subagent,
            provider_tag,
            index_queue,
            hydrated: AtomicBool::new(false),
            turn_loop: Mutex::new(None),
            committed_model: Mutex::new(None),
            cwd: Mutex::new(None),
            agent_working: AtomicBool::new(false),
            working_tx,
            running_ctx: Mutex::new(None),
            run_handle: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        });

        let weak = Arc::downgrade(&manager);
        recorder.register_end_of_turn_hook(
            conversation_id,
            Arc::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.set_agent_working(false);
                }
            }),
        );

        manager
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn is_agent_working(&self) -> bool {
        self.agent_working.load(Ordering::SeqCst)
    }

    pub fn subscribe_working(&self) -> watch::Receiver<bool> {
        self.working_tx.subscribe()
    }

    pub fn cwd(&self) -> Option<String> {
        self.cwd.lock().unwrap().clone()
    }

    pub fn subagent_depth(&self) -> u32 {
        self.depth
    }

    /// The cancellation signal of whatever turn is currently running, for a
    /// Sub-agent Runner to watch (§4.5 "poll ... until caller cancelled").
    /// A conversation with no turn in flight is trivially never cancelled.
    pub fn cancel_signal(&self) -> tokio_util::sync::CancellationToken {
        self.running_ctx
            .lock()
            .unwrap()
            .as_ref()
            .map(|ctx| ctx.cancel.clone())
            .unwrap_or_default()
    }

    pub fn max_subagent_depth(&self) -> u32 {
        self.max_depth
    }

    /// Whether a sub-agent tool is available at this manager's depth (§4.3
    /// "Sub-agent depth").
    pub fn can_spawn_subagent(&self) -> bool {
        self.depth < self.max_depth
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn set_agent_working(&self, working: bool) {
        let previous = self.agent_working.swap(working, Ordering::SeqCst);
        if previous != working {
            let _ = self.working_tx.send(working);
            self.recorder.buses().bus_for(self.conversation_id).broadcast(serde_json::json!({
                "conversation_state": {
                    "conversation_id": self.conversation_id.to_string(),
                    "working": working,
                }
            }));
            if !working {
                self.recorder.buses().bus_for(self.conversation_id).broadcast(serde_json::json!({
                    "notification_event": { "conversation_id": self.conversation_id.to_string() }
                }));
                self.index_queue.enqueue(self.conversation_id);
            }
        }
    }

    /// Load conversation metadata; synthesize a system message if none
    /// exists yet. Idempotent (§4.3 "Hydrate").
    pub fn hydrate(&self) -> Result<()> {
        if self.hydrated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let conv = self
            .store
            .get_conversation(self.conversation_id)?
            .ok_or(RuntimeError::ConversationNotFound(self.conversation_id))?;
        *self.cwd.lock().unwrap() = conv.cwd.clone();
        *self.committed_model.lock().unwrap() = conv.model.clone();

        let mut messages = self.store.list_messages(self.conversation_id)?;
        let has_system = messages.iter().any(|m| m.message_type == MessageType::System);
        let system_text = if self.is_subagent { SUBAGENT_SYSTEM_PROMPT } else { DEFAULT_SYSTEM_PROMPT };

        if !has_system {
            let sys = Message::system(self.conversation_id, system_text);
            let recorded = self.recorder.record(self.conversation_id, sys)?;
            messages.push(recorded);
        }

        let turn_loop = Arc::new(TurnLoop::new(
            self.llm.clone(),
            self.tools.clone(),
            self.recorder.clone(),
            system_text.to_string(),
            messages,
            self.context_window_fraction,
        ));
        turn_loop.set_cwd(conv.cwd);
        *self.turn_loop.lock().unwrap() = Some(turn_loop);
        Ok(())
    }

    /// Hydrate if needed, record the user message immediately, enqueue it
    /// for the loop, and mark the conversation as working (§4.3
    /// "AcceptUserMessage"). Returns whether this was the conversation's
    /// first committed message.
    pub fn accept_user_message(&self, model_id: &str, content: Vec<Content>) -> Result<bool> {
        self.hydrate()?;
        self.touch();

        let was_first = {
            let mut committed = self.committed_model.lock().unwrap();
            match committed.as_deref() {
                Some(existing) if existing != model_id => {
                    return Err(RuntimeError::ModelMismatch {
                        committed: existing.to_string(),
                        requested: model_id.to_string(),
                    });
                }
                Some(_) => false,
                None => {
                    *committed = Some(model_id.to_string());
                    true
                }
            }
        };

        let recorded = self.recorder.record(self.conversation_id, Message::user(self.conversation_id, content))?;

        let turn_loop = self
            .turn_loop
            .lock()
            .unwrap()
            .clone()
            .expect("hydrate() populates turn_loop");
        turn_loop.enqueue(recorded);

        self.set_agent_working(true);
        self.ensure_running(model_id);

        Ok(was_first)
    }

    fn ensure_running(&self, model_id: &str) {
        let mut handle = self.run_handle.lock().unwrap();
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return;
            }
        }

        let ctx = RequestContext::new(self.conversation_id, model_id, self.provider_tag.clone());
        *self.running_ctx.lock().unwrap() = Some(ctx.clone());

        let turn_loop = self
            .turn_loop
            .lock()
            .unwrap()
            .clone()
            .expect("hydrate() populates turn_loop");

        *handle = Some(tokio::spawn(async move {
            turn_loop.run(&ctx).await;
        }));
    }

    /// Cancel the loop context; if a tool was left unpaired, record its
    /// cancelled result; always record a terminal "[Operation cancelled]"
    /// message; reset hydration so the next `accept_user_message` reloads
    /// fresh (§4.3 "CancelConversation").
    pub fn cancel(&self) -> Result<()> {
        let ctx = self.running_ctx.lock().unwrap().clone();
        if let Some(ctx) = ctx {
            ctx.cancel.cancel();
        }

        let turn_loop = self.turn_loop.lock().unwrap().clone();
        if let Some(turn_loop) = turn_loop {
            for tool_use_id in unpaired_tool_use_ids(&turn_loop.history()) {
                let cancelled = Message::tool_result(
                    self.conversation_id,
                    vec![Content::tool_result(tool_use_id, "Tool execution cancelled by user", true)],
                );
                self.recorder.record(self.conversation_id, cancelled)?;
            }
        }

        let mut terminal = Message::agent(self.conversation_id, vec![Content::text("[Operation cancelled]")]);
        terminal.error_kind = Some(ErrorKind::Cancellation);
        terminal.end_of_turn = true;
        self.recorder.record(self.conversation_id, terminal)?;

        self.set_agent_working(false);
        self.hydrated.store(false, Ordering::SeqCst);
        *self.turn_loop.lock().unwrap() = None;
        *self.running_ctx.lock().unwrap() = None;
        Ok(())
    }

    /// Called by a tool's cwd-mutating callback hook (§4.3
    /// "Working-directory contract"): persist, update in-memory, broadcast.
    pub fn set_cwd(&self, new_cwd: String) -> Result<()> {
        self.store.touch_conversation(self.conversation_id, Some(&new_cwd), None)?;
        *self.cwd.lock().unwrap() = Some(new_cwd.clone());
        if let Some(turn_loop) = self.turn_loop.lock().unwrap().clone() {
            turn_loop.set_cwd(Some(new_cwd.clone()));
        }
        self.recorder.buses().bus_for(self.conversation_id).broadcast(serde_json::json!({
            "conversation": { "conversation_id": self.conversation_id.to_string(), "cwd": new_cwd }
        }));
        Ok(())
    }
}

fn unpaired_tool_use_ids(history: &[Message]) -> Vec<ToolUseId> {
    let Some(last_assistant_idx) = history.iter().rposition(|m| m.message_type == MessageType::Agent) else {
        return Vec::new();
    };
    let ids: Vec<ToolUseId> = history[last_assistant_idx]
        .content
        .iter()
        .filter_map(|c| c.as_tool_use_id().cloned())
        .collect();
    if ids.is_empty() {
        return Vec::new();
    }
    let satisfied: HashSet<ToolUseId> = history[last_assistant_idx + 1..]
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|c| c.as_tool_result_id().cloned())
        .collect();
    ids.into_iter().filter(|id| !satisfied.contains(id)).collect()
}

/// Process-wide table of active managers, keyed by `ConversationId`,
/// evicted after a sliding inactivity window (§4.3 "Lifecycle") — a
/// `DashMap`, following the teacher's `AppState` table convention (§5).
pub struct ManagerRegistry {
    managers: DashMap<ConversationId, Arc<ConversationManager>>,
    idle_window: Duration,
}

impl ManagerRegistry {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            managers: DashMap::new(),
            idle_window,
        }
    }

    pub fn get(&self, id: ConversationId) -> Option<Arc<ConversationManager>> {
        self.managers.get(&id).map(|e| e.clone())
    }

    pub fn get_or_insert_with(&self, id: ConversationId, factory: impl FnOnce() -> Arc<ConversationManager>) -> Arc<ConversationManager> {
        self.managers.entry(id).or_insert_with(factory).clone()
    }

    /// Remove and drop every manager idle for longer than the configured
    /// window, stopping its loop and releasing its tool-set.
    pub fn evict_idle(&self) -> usize {
        let stale: Vec<ConversationId> = self
            .managers
            .iter()
            .filter(|e| e.value().idle_for() >= self.idle_window && !e.value().is_agent_working())
            .map(|e| *e.key())
            .collect();

        for id in &stale {
            self.managers.remove(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusRegistry;
    use crate::index_queue::NoopIndexer;
    use crate::llm::{ChatRequest, ChatResponse, ProviderError};
    use crate::tool::DelayTool;
    use async_trait::async_trait;
    use shelley_core::{StopReason, Usage};
    use shelley_store::SqliteStore;

    struct EndTurnLlm;
    #[async_trait]
    impl LlmService for EndTurnLlm {
        async fn send(&self, _ctx: &RequestContext, _request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: vec![Content::text("hi!")],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "mock".into(),
            })
        }
        fn token_context_window(&self) -> Option<u32> {
            None
        }
    }

    fn setup_manager(llm: Arc<dyn LlmService>, tools: Vec<Arc<dyn Tool>>) -> (Arc<ConversationManager>, ConversationId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conv = Conversation::new_user_initiated(None, None);
        store.create_conversation(&conv).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        let recorder = Arc::new(Recorder::new(store.clone(), buses));
        let index_queue = Arc::new(IndexQueue::new(Arc::new(NoopIndexer), 16));
        let manager = ConversationManager::new(conv.id, store, recorder, llm, tools, 0.8, 0, 1, false, "mock".into(), index_queue);
        (manager, conv.id)
    }

    #[test]
    fn hydrate_synthesizes_system_message_once() {
        let (manager, conv_id) = setup_manager(Arc::new(EndTurnLlm), vec![]);
        manager.hydrate().unwrap();
        manager.hydrate().unwrap();
        let messages = manager.store.list_messages(conv_id).unwrap();
        let system_count = messages.iter().filter(|m| m.message_type == MessageType::System).count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn model_mismatch_is_rejected() {
        let (manager, _conv_id) = setup_manager(Arc::new(EndTurnLlm), vec![]);
        manager.accept_user_message("model-a", vec![Content::text("hi")]).unwrap();
        let err = manager.accept_user_message("model-b", vec![Content::text("hi again")]).unwrap_err();
        assert_eq!(err.code(), "MODEL_MISMATCH");
    }

    #[tokio::test]
    async fn accept_message_flips_working_then_settles_idle() {
        let (manager, _conv_id) = setup_manager(Arc::new(EndTurnLlm), vec![]);
        manager.accept_user_message("model-a", vec![Content::text("hi")]).unwrap();
        assert!(manager.is_agent_working());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_agent_working());
    }

    #[tokio::test]
    async fn turn_end_enqueues_conversation_for_indexing() {
        use crate::index_queue::Indexer;
        use std::sync::Mutex as StdMutex;

        struct RecordingIndexer {
            seen: StdMutex<Vec<ConversationId>>,
        }
        #[async_trait]
        impl Indexer for RecordingIndexer {
            async fn index(&self, conversation_id: ConversationId) {
                self.seen.lock().unwrap().push(conversation_id);
            }
        }

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conv = Conversation::new_user_initiated(None, None);
        store.create_conversation(&conv).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        let recorder = Arc::new(Recorder::new(store.clone(), buses));
        let indexer = Arc::new(RecordingIndexer { seen: StdMutex::new(Vec::new()) });
        let index_queue = Arc::new(IndexQueue::new(indexer.clone(), 16));
        let manager = ConversationManager::new(
            conv.id, store, recorder, Arc::new(EndTurnLlm), vec![], 0.8, 0, 1, false, "mock".into(), index_queue.clone(),
        );

        manager.accept_user_message("model-a", vec![Content::text("hi")]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_agent_working());
        drop(manager);

        let index_queue = Arc::try_unwrap(index_queue).unwrap_or_else(|_| panic!("queue still shared"));
        index_queue.shutdown().await;
        assert_eq!(indexer.seen.lock().unwrap().as_slice(), &[conv.id]);
    }

    #[tokio::test]
    async fn cancel_mid_tool_records_cancelled_result_and_terminal_message() {
        struct ToolUseLlm;
        #[async_trait]
        impl LlmService for ToolUseLlm {
            async fn send(&self, _ctx: &RequestContext, _request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
                Ok(ChatResponse {
                    content: vec![Content::tool_use(ToolUseId::new("t1"), "delay", serde_json::json!({}))],
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                    model: "mock".into(),
                })
            }
            fn token_context_window(&self) -> Option<u32> {
                None
            }
        }

        let (manager, conv_id) = setup_manager(Arc::new(ToolUseLlm), vec![Arc::new(DelayTool { millis: 300 })]);
        manager.accept_user_message("model-a", vec![Content::text("delay: 5")]).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.cancel().unwrap();

        let messages = manager.store.list_messages(conv_id).unwrap();
        let cancelled_results = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|c| matches!(c, Content::ToolResult { is_error: true, .. }))
            .count();
        let terminal_count = messages.iter().filter(|m| m.error_kind == Some(ErrorKind::Cancellation)).count();
        assert_eq!(cancelled_results, 1);
        assert_eq!(terminal_count, 1);
        assert!(!manager.is_agent_working());
    }

    #[test]
    fn registry_evicts_idle_managers() {
        let (manager, conv_id) = setup_manager(Arc::new(EndTurnLlm), vec![]);
        let registry = ManagerRegistry::new(Duration::from_millis(1));
        registry.get_or_insert_with(conv_id, || manager.clone());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_idle(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unpaired_detection_ignores_fully_satisfied_tool_use() {
        let conv_id = ConversationId::new();
        let tid = ToolUseId::new("t1");
        let history = vec![
            Message::agent(conv_id, vec![Content::tool_use(tid.clone(), "echo", serde_json::json!({}))]),
            Message::user(conv_id, vec![Content::tool_result(tid, "ok", false)]),
        ];
        assert!(unpaired_tool_use_ids(&history).is_empty());
    }
}
