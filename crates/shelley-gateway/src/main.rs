use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod auth;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelley_gateway=info,shelley_runtime=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("SHELLEY_CONFIG").ok();
    let config = shelley_core::config::RuntimeConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        shelley_core::config::RuntimeConfig::default()
    });

    let store: Arc<dyn shelley_store::ConversationStore> = Arc::new(shelley_store::SqliteStore::open(&config.database.path)?);
    let llm: Arc<dyn shelley_runtime::LlmService> = Arc::new(shelley_runtime::MockLlm::new(None));
    let tools: Vec<Arc<dyn shelley_runtime::Tool>> = vec![];

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config, store, llm, tools));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "shelley gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
