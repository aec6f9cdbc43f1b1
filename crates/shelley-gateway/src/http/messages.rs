//! POST /conversations/{id}/messages and POST /conversations/{id}/cancel
//! (§6.4 "accepts a user message" / "cancels the current turn").

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shelley_core::{Content, Conversation, ConversationId};
use shelley_store::ConversationStore;
use tracing::warn;

use crate::app::AppState;
use crate::auth::check_auth;

#[derive(Deserialize)]
pub struct AcceptMessageRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

fn unauthorized() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError {
            error: "Unauthorized. Set 'Authorization: Bearer <token>'.".to_string(),
            code: "UNAUTHORIZED".to_string(),
        }),
    )
}

/// POST /conversations/{conversation_id}/messages — durably record and
/// enqueue a user message, creating the conversation on first use, then
/// return `202 Accepted` (§6.4).
pub async fn accept_message_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<ConversationId>,
    headers: HeaderMap,
    Json(req): Json<AcceptMessageRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    if req.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "message cannot be empty".to_string(),
                code: "BAD_REQUEST".to_string(),
            }),
        ));
    }

    if state.store.get_conversation(conversation_id).map_err(internal_error)?.is_none() {
        let now = Utc::now();
        let conv = Conversation {
            id: conversation_id,
            slug: None,
            parent: None,
            cwd: None,
            model: None,
            user_initiated: true,
            created_at: now,
            updated_at: now,
        };
        state.store.create_conversation(&conv).map_err(internal_error)?;
    }

    let manager = state.manager_for(conversation_id);
    let model_id = req.model.unwrap_or_else(|| state.config.agent.model.clone());

    manager
        .accept_user_message(&model_id, vec![Content::text(req.message)])
        .map_err(|e| {
            warn!(error = %e, code = e.code(), "accept_user_message failed");
            (
                StatusCode::CONFLICT,
                Json(ApiError {
                    error: e.to_string(),
                    code: e.code().to_string(),
                }),
            )
        })?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /conversations/{conversation_id}/cancel — cancel the current turn
/// (§6.4, §4.3 "CancelConversation").
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<ConversationId>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    let Some(manager) = state.managers.get(conversation_id) else {
        return Ok(StatusCode::NO_CONTENT);
    };

    manager.cancel().map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn internal_error<E: std::fmt::Display>(e: E) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: e.to_string(),
            code: "INTERNAL_ERROR".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelley_core::config::RuntimeConfig;
    use shelley_runtime::MockLlm;
    use shelley_store::SqliteStore;

    fn harness() -> Arc<AppState> {
        let store: Arc<dyn shelley_store::ConversationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let llm: Arc<dyn shelley_runtime::LlmService> = Arc::new(MockLlm::with_responses(None, vec![shelley_runtime::mock_llm::end_turn("ok")]));
        Arc::new(AppState::new(RuntimeConfig::default(), store, llm, vec![]))
    }

    #[tokio::test]
    async fn accept_message_creates_conversation_and_returns_accepted() {
        let state = harness();
        let conv_id = ConversationId::new();

        let status = accept_message_handler(
            State(state.clone()),
            Path(conv_id),
            HeaderMap::new(),
            Json(AcceptMessageRequest { message: "hi".into(), model: None }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.store.get_conversation(conv_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn accept_message_rejects_empty_message() {
        let state = harness();
        let conv_id = ConversationId::new();

        let err = accept_message_handler(
            State(state.clone()),
            Path(conv_id),
            HeaderMap::new(),
            Json(AcceptMessageRequest { message: "   ".into(), model: None }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_on_unknown_conversation_is_a_no_op() {
        let state = harness();
        let status = cancel_handler(State(state), Path(ConversationId::new()), HeaderMap::new()).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
