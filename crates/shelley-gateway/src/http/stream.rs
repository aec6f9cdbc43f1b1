//! GET /conversations/{id}/stream — the server-sent-events boundary (§6.4,
//! §4.7): catch-up from the store merged with live bus events, keyed on the
//! client's last-seen `SequenceId`, with a 30s heartbeat while idle.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use serde::Deserialize;
use shelley_core::{ConversationId, SequenceId};
use shelley_runtime::{api_message, BusEvent};
use shelley_store::ConversationStore;

use crate::app::AppState;
use crate::auth::check_auth;
use crate::http::messages::ApiError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub since: u64,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    if !check_auth(&state, &headers) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "Unauthorized. Set 'Authorization: Bearer <token>'.".to_string(),
                code: "UNAUTHORIZED".to_string(),
            }),
        ));
    }

    let since = SequenceId(query.since);
    let catch_up = state.store.list_messages_since(conversation_id, since).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                error: e.to_string(),
                code: "INTERNAL_ERROR".to_string(),
            }),
        )
    })?;

    let last_seen = catch_up.last().map(|m| m.sequence_id).unwrap_or(since);
    let bus = state.buses.bus_for(conversation_id);
    let subscription = bus.subscribe(last_seen);

    let stream = async_stream::stream! {
        if !catch_up.is_empty() {
            let payload = serde_json::json!({
                "messages": catch_up.iter().map(api_message).collect::<Vec<_>>(),
                "conversation_id": conversation_id.to_string(),
            });
            yield Ok::<_, std::convert::Infallible>(Event::default().data(payload.to_string()));
        }

        let mut rx = subscription.rx;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(BusEvent::Message { payload, .. }) => {
                            yield Ok(Event::default().data(payload.to_string()));
                        }
                        Some(BusEvent::Broadcast { payload }) => {
                            yield Ok(Event::default().data(payload.to_string()));
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    yield Ok(Event::default().data(serde_json::json!({"heartbeat": true}).to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}
