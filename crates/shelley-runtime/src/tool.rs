//! The `Tool` boundary (§6.2). Concrete tool implementations (bash, patch,
//! browser) are out of scope — only `EchoTool`/`FailingTool` (test-support)
//! ship with this crate.

use async_trait::async_trait;
use shelley_core::Content;

use crate::context::RequestContext;

/// Per-call context available to a running tool: the conversation's ambient
/// working directory and its own cancellation handle (§6.2, §9 "Map-keyed
/// cancellation").
#[derive(Clone)]
pub struct ToolContext {
    pub request: RequestContext,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOut {
    pub content: Vec<Content>,
    pub display_payload: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ToolOut {
    pub fn ok(content: Vec<Content>) -> Self {
        Self {
            content,
            display_payload: None,
            error: None,
        }
    }

    pub fn ok_text(text: impl Into<String>) -> Self {
        Self::ok(vec![Content::text(text)])
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            display_payload: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;

    /// Whether a call to this tool always ends the current turn regardless
    /// of the LLM's stop reason (§6.2) — none of the test-support tools set
    /// this, but a real tool (e.g. one that hands off to a human) might.
    fn ends_turn(&self) -> bool {
        false
    }

    /// Whether this tool's definition is eligible for the request builder's
    /// cache hint (§4.1 step 2, §6.2 "Cache"). Defaults to eligible; a tool
    /// whose schema varies call-to-call should opt out.
    fn cache(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolOut;
}

/// Returns Text content equal to its `"text"` input field, or the whole
/// input JSON-stringified if absent. Used to exercise the tool-call
/// protocol without a real side effect.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes its input back as text."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } }
        })
    }

    async fn run(&self, _ctx: &ToolContext, input: serde_json::Value) -> ToolOut {
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| input.to_string());
        ToolOut::ok_text(text)
    }
}

/// Always returns an error result. Used to exercise `ErrorKind::ToolFailure`
/// paths without a real failing subprocess.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn run(&self, _ctx: &ToolContext, _input: serde_json::Value) -> ToolOut {
        ToolOut::failed("simulated tool failure")
    }
}

/// A tool that sleeps for a configured duration before succeeding — used to
/// drive mid-tool cancellation scenarios (§8 scenario 3).
pub struct DelayTool {
    pub millis: u64,
}

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Sleeps before returning, for cancellation testing."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn run(&self, ctx: &ToolContext, _input: serde_json::Value) -> ToolOut {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(self.millis)) => {
                ToolOut::ok_text("done")
            }
            _ = ctx.request.cancel.cancelled() => {
                ToolOut::failed("cancelled")
            }
        }
    }
}
