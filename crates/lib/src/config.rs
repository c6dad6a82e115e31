//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.portico/config.json`) and environment.
//! Covers the gateway surface (bind, auth, rate limit, origins, timeouts) and the agent portal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Agent portal settings (reasoning backend used by the chat capability).
    #[serde(default)]
    pub agents: AgentsConfig,
}

/// Gateway bind, port, auth, and policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,

    /// Fixed-window rate limit applied per client address.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Browser origins allowed to talk to the gateway. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Streaming connections silent for longer than this are evicted.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How often the idle sweep and keep-alive tick run.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Default bound on handler execution for handlers registered with the default timeout policy.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_default_timeout_ms: u64,

    /// Memory sessions untouched for longer than this are dropped by the sweeper. 0 keeps them.
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret. Overridden by PORTICO_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the bearer token to match the configured token.
    Token,
}

/// Fixed-window rate limit. `maxRequests == 0` disables limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u32,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    15_000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_session_idle_timeout_ms() -> u64 {
    3_600_000
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_rate_max_requests() -> u32 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            allowed_origins: Vec::new(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            handler_default_timeout_ms: default_handler_timeout_ms(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_requests: default_rate_max_requests(),
        }
    }
}

impl GatewayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Never zero, so the sweep timer cannot spin.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn handler_default_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_default_timeout_ms)
    }

    /// `None` when session eviction is disabled.
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_ms > 0).then(|| Duration::from_millis(self.session_idle_timeout_ms))
    }
}

/// Agent portal defaults (Ollama base URL, model, system prompt).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Ollama base URL (default http://127.0.0.1:11434).
    pub base_url: Option<String>,
    /// Model name as listed by `ollama list` (e.g. "llama3.2:latest").
    pub default_model: Option<String>,
    /// Prepended to every chat turn as the system message.
    pub system_prompt: Option<String>,
}

/// Resolve the gateway token: env PORTICO_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("PORTICO_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// When auth mode is token and a token is configured, returns it for request validation.
pub fn required_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == GatewayAuthMode::Token {
        resolve_gateway_token(config)
    } else {
        None
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PORTICO_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".portico").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or PORTICO_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
