use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default cap on a conversation's Turn Loop mailbox drain wait (§4.1 step 1).
pub const MAILBOX_POLL_MS: u64 = 100;
/// Default Backpressured Index Queue capacity (§4.8).
pub const DEFAULT_INDEX_QUEUE_CAPACITY: usize = 64;
/// Default per-subscriber buffer before the Subscriber Bus drops it (§4.7).
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
/// Default sliding inactivity window before a Conversation Manager is evicted (§4.3).
pub const DEFAULT_MANAGER_IDLE_MINUTES: u64 = 30;
/// Default sub-agent fan-out depth limit (§4.3, §4.5).
pub const DEFAULT_MAX_SUBAGENT_DEPTH: u32 = 1;
/// Context-window fullness fraction at which a warning message is emitted (§4.1 step 6).
pub const DEFAULT_CONTEXT_WINDOW_WARNING_FRACTION: f64 = 0.8;

/// Top-level runtime configuration (`shelley.toml` + `SHELLEY_*` env overrides),
/// loaded the way the teacher loads `SkynetConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runtime: RuntimeTuning,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                port: DEFAULT_PORT,
                bind: DEFAULT_BIND.to_string(),
                auth: AuthConfig {
                    mode: AuthMode::None,
                    token: None,
                },
            },
            agent: AgentConfig {
                model: default_model(),
                provider_tag: default_provider_tag(),
            },
            database: DatabaseConfig::default(),
            runtime: RuntimeTuning::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Identity tag attached by the Transport Wrapper (§4.6); providers
    /// tagged `"fireworks"` additionally receive an `x-session-affinity` header.
    #[serde(default = "default_provider_tag")]
    pub provider_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for §4.1–§4.8 that have sensible defaults but are worth
/// exposing — mirrors the teacher's practice of surfacing protocol constants
/// (`PROTOCOL_VERSION`, `HEARTBEAT_INTERVAL_SECS`, ...) as config fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTuning {
    #[serde(default = "default_index_queue_capacity")]
    pub index_queue_capacity: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_manager_idle_minutes")]
    pub manager_idle_minutes: u64,
    #[serde(default = "default_max_subagent_depth")]
    pub max_subagent_depth: u32,
    #[serde(default = "default_context_window_warning_fraction")]
    pub context_window_warning_fraction: f64,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            index_queue_capacity: default_index_queue_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
            manager_idle_minutes: default_manager_idle_minutes(),
            max_subagent_depth: default_max_subagent_depth(),
            context_window_warning_fraction: default_context_window_warning_fraction(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_provider_tag() -> String {
    "anthropic".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shelley/shelley.db", home)
}
fn default_index_queue_capacity() -> usize {
    DEFAULT_INDEX_QUEUE_CAPACITY
}
fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}
fn default_manager_idle_minutes() -> u64 {
    DEFAULT_MANAGER_IDLE_MINUTES
}
fn default_max_subagent_depth() -> u32 {
    DEFAULT_MAX_SUBAGENT_DEPTH
}
fn default_context_window_warning_fraction() -> f64 {
    DEFAULT_CONTEXT_WINDOW_WARNING_FRACTION
}

impl RuntimeConfig {
    /// Load config from a TOML file with `SHELLEY_*` env var overrides.
    ///
    /// Checks in order: explicit path argument, then `~/.shelley/shelley.toml`.
    /// Missing file is not an error — `Figment` simply contributes nothing
    /// and defaults (or env overrides) apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RuntimeConfig = Figment::from(figment::providers::Serialized::defaults(
            RuntimeConfig::default(),
        ))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("SHELLEY_").split("_"))
        .extract()
        .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shelley/shelley.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.runtime.max_subagent_depth, 1);
        assert!(cfg.runtime.context_window_warning_fraction > 0.0);
    }

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let cfg = RuntimeConfig::load(Some("/nonexistent/path/shelley.toml")).unwrap();
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
    }
}
