use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use shelley_core::config::RuntimeConfig;
use shelley_runtime::{BusRegistry, ConversationManager, IndexQueue, LlmService, ManagerRegistry, NoopIndexer, Recorder, Tool};
use shelley_store::ConversationStore;

/// Central shared state, passed as `Arc<AppState>` to every handler.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<dyn ConversationStore>,
    pub recorder: Arc<Recorder>,
    pub buses: Arc<BusRegistry>,
    pub managers: ManagerRegistry,
    pub llm: Arc<dyn LlmService>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub index_queue: Arc<IndexQueue>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, store: Arc<dyn ConversationStore>, llm: Arc<dyn LlmService>, tools: Vec<Arc<dyn Tool>>) -> Self {
        let buses = Arc::new(BusRegistry::new(config.runtime.subscriber_buffer));
        let recorder = Arc::new(Recorder::new(store.clone(), buses.clone()));
        let managers = ManagerRegistry::new(Duration::from_secs(config.runtime.manager_idle_minutes * 60));
        // §4.8: every ended turn is enqueued here for re-indexing; no
        // concrete indexer ships, so `NoopIndexer` is the default sink.
        let index_queue = Arc::new(IndexQueue::new(Arc::new(NoopIndexer), config.runtime.index_queue_capacity));
        Self {
            config,
            store,
            recorder,
            buses,
            managers,
            llm,
            tools,
            index_queue,
        }
    }

    /// Fetch or construct the manager for `conversation_id` (§4.3 "one
    /// manager per active conversation, reused across requests").
    pub fn manager_for(&self, conversation_id: shelley_core::ConversationId) -> Arc<ConversationManager> {
        let state_tools = self.tools.clone();
        let state_llm = self.llm.clone();
        let state_store = self.store.clone();
        let state_recorder = self.recorder.clone();
        let context_window_fraction = self.config.runtime.context_window_warning_fraction;
        let max_subagent_depth = self.config.runtime.max_subagent_depth;
        let provider_tag = self.config.agent.provider_tag.clone();
        let index_queue = self.index_queue.clone();
        self.managers.get_or_insert_with(conversation_id, move || {
            ConversationManager::new(
                conversation_id,
                state_store,
                state_recorder,
                state_llm,
                state_tools,
                context_window_fraction,
                0,
                max_subagent_depth,
                false,
                provider_tag,
                index_queue,
            )
        })
    }
}

/// Assemble the full Axum router, following the teacher's `build_router`
/// convention (one route per handler module, a single `TraceLayer`).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/conversations/{conversation_id}/messages",
            post(crate::http::messages::accept_message_handler),
        )
        .route(
            "/conversations/{conversation_id}/cancel",
            post(crate::http::messages::cancel_handler),
        )
        .route(
            "/conversations/{conversation_id}/stream",
            get(crate::http::stream::stream_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
