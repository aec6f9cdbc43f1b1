//! LLM Transport Wrapper (§4.6): the thin layer a concrete `LlmService`
//! adapter (out of scope here; see §1) sits on top of to get product
//! identity headers, conversation correlation, and request/response
//! buffering for the Recorder's debug callback, for free.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use shelley_core::ConversationId;

use crate::error::{Result, RuntimeError};

const FIREWORKS_PROVIDER_TAG: &str = "fireworks";

/// What a transport call looked like, handed to the debug callback
/// regardless of success (§4.6 "buffer request/response bodies").
#[derive(Debug, Clone)]
pub struct TransportOutcome {
    pub status: u16,
    pub duration: Duration,
    pub request_body: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub error: Option<String>,
}

pub type DebugHook = Arc<dyn Fn(&TransportOutcome) + Send + Sync>;

pub struct TransportWrapper {
    client: reqwest::Client,
    product_identity: String,
    debug_hook: Option<DebugHook>,
}

impl TransportWrapper {
    pub fn new(product_identity: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            product_identity: product_identity.into(),
            debug_hook: None,
        }
    }

    pub fn with_debug_hook(mut self, hook: DebugHook) -> Self {
        self.debug_hook = Some(hook);
        self
    }

    /// Product identity always, `Shelley-Conversation-Id` when a
    /// conversation is known, `x-session-affinity` additionally for
    /// `fireworks`-tagged providers (§4.6).
    pub fn build_headers(&self, conversation_id: Option<ConversationId>, provider_tag: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-shelley-client"),
            HeaderValue::from_str(&self.product_identity).unwrap_or_else(|_| HeaderValue::from_static("shelley")),
        );

        if let Some(id) = conversation_id {
            if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
                headers.insert(HeaderName::from_static("shelley-conversation-id"), value.clone());
                if provider_tag == FIREWORKS_PROVIDER_TAG {
                    headers.insert(HeaderName::from_static("x-session-affinity"), value);
                }
            }
        }

        headers
    }

    /// POST `body` to `url`, attaching the headers above, and report the
    /// outcome to the debug hook. The caller sees the response body exactly
    /// as returned — buffering is purely for the side-channel callback
    /// (§4.6 "reinject buffered bodies so caller sees no behavioral
    /// difference").
    pub async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
        conversation_id: Option<ConversationId>,
        provider_tag: &str,
    ) -> Result<(u16, serde_json::Value)> {
        let started = Instant::now();
        let headers = self.build_headers(conversation_id, provider_tag);

        let send_result = self.client.post(url).headers(headers).json(&body).send().await;

        match send_result {
            Ok(response) => {
                let status = response.status().as_u16();
                let response_body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
                self.report(TransportOutcome {
                    status,
                    duration: started.elapsed(),
                    request_body: body,
                    response_body: Some(response_body.clone()),
                    error: None,
                });
                Ok((status, response_body))
            }
            Err(e) => {
                let message = e.to_string();
                self.report(TransportOutcome {
                    status: 0,
                    duration: started.elapsed(),
                    request_body: body,
                    response_body: None,
                    error: Some(message.clone()),
                });
                Err(RuntimeError::Internal(format!("transport error: {message}")))
            }
        }
    }

    fn report(&self, outcome: TransportOutcome) {
        if let Some(hook) = &self.debug_hook {
            hook(&outcome);
        }
    }
}
