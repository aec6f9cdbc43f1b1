//! The Conversation Runtime (§2): turn-taking, protocol repair, message
//! recording and fan-out, sub-agents, and the supporting transport/index
//! plumbing, built on top of `shelley-core` and `shelley-store`.

pub mod bus;
pub mod context;
pub mod error;
pub mod git;
pub mod index_queue;
pub mod llm;
pub mod manager;
pub mod mock_llm;
pub mod protocol_repair;
pub mod recorder;
pub mod subagent;
pub mod tool;
pub mod transport;
pub mod turn_loop;

pub use bus::{BusEvent, BusRegistry, ConversationBus, Subscription};
pub use context::RequestContext;
pub use error::{Result, RuntimeError};
pub use git::GitState;
pub use index_queue::{IndexQueue, Indexer, NoopIndexer};
pub use llm::{ChatRequest, ChatResponse, LlmService, ProviderError, ToolDefinition};
pub use manager::{ConversationManager, ManagerRegistry};
pub use mock_llm::MockLlm;
pub use recorder::{api_message, Recorder};
pub use subagent::SubagentRunner;
pub use tool::{Tool, ToolContext, ToolOut};
pub use transport::TransportWrapper;
pub use turn_loop::{TurnLoop, TurnOutcome};
