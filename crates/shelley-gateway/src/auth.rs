//! Bearer-token auth, following the teacher's `check_auth`/`extract_bearer`
//! split in `skynet-gateway`'s `/chat` handler.

use axum::http::HeaderMap;
use shelley_core::config::AuthMode;

use crate::app::AppState;

/// Returns true if the request is authorized under the configured `AuthMode`.
pub fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.gateway.auth.mode {
        AuthMode::None => true,
        AuthMode::Token => {
            let expected = match &state.config.gateway.auth.token {
                Some(t) => t.as_str(),
                None => return false,
            };
            extract_bearer(headers).map(|t| t == expected).unwrap_or(false)
        }
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelley_core::config::{AuthConfig, RuntimeConfig};
    use shelley_runtime::MockLlm;
    use shelley_store::SqliteStore;
    use std::sync::Arc;

    fn state_with_auth(mode: AuthMode, token: Option<&str>) -> AppState {
        let mut config = RuntimeConfig::default();
        config.gateway.auth = AuthConfig {
            mode,
            token: token.map(String::from),
        };
        let store: Arc<dyn shelley_store::ConversationStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let llm: Arc<dyn shelley_runtime::LlmService> = Arc::new(MockLlm::new(None));
        AppState::new(config, store, llm, vec![])
    }

    #[test]
    fn none_mode_always_authorizes() {
        let state = state_with_auth(AuthMode::None, None);
        assert!(check_auth(&state, &HeaderMap::new()));
    }

    #[test]
    fn token_mode_requires_matching_bearer_header() {
        let state = state_with_auth(AuthMode::Token, Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(check_auth(&state, &headers));

        let mut wrong = HeaderMap::new();
        wrong.insert("authorization", "Bearer nope".parse().unwrap());
        assert!(!check_auth(&state, &wrong));
        assert!(!check_auth(&state, &HeaderMap::new()));
    }

    #[test]
    fn token_mode_without_configured_token_always_denies() {
        let state = state_with_auth(AuthMode::Token, None);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer anything".parse().unwrap());
        assert!(!check_auth(&state, &headers));
    }
}
