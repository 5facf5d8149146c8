//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Every section has defaults so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Status gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Which messaging transport to run and its settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Reply generation backend.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// SQLite message log.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Message filter defaults.
    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP status surface (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Allow binding to a non-loopback address. The status page exposes the pairing code,
    /// so this is off unless explicitly enabled.
    #[serde(default)]
    pub allow_remote: bool,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            allow_remote: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Out-of-process session client talking to us over HTTP (e.g. a WhatsApp Web sidecar).
    #[default]
    Bridge,

    /// Telegram Bot API long-poll.
    Telegram,
}

/// Transport selection plus per-transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    #[serde(default)]
    pub telegram: TelegramChannelConfig,

    #[serde(default)]
    pub bridge: BridgeChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
}

/// Bridge channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeChannelConfig {
    /// Base URL of the sidecar; replies are POSTed to `<url>/reply`.
    #[serde(default = "default_bridge_url")]
    pub url: String,

    /// Shared secret expected in `X-Parley-Bridge-Secret` on event POSTs. Overridden by PARLEY_BRIDGE_SECRET.
    pub secret: Option<String>,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

impl Default for BridgeChannelConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    #[default]
    Gemini,
    Ollama,
}

/// Reply generation backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default)]
    pub backend: GenerationBackend,

    /// Model name passed as-is to the backend. Each backend has its own fallback when unset.
    pub model: Option<String>,

    /// API key (Gemini). Overridden by GEMINI_API_KEY env when set.
    pub api_key: Option<String>,

    /// Override the backend base URL (tests, proxies, remote Ollama).
    pub base_url: Option<String>,
}

/// Storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// SQLite file path (default ~/.parley/messages.db). Overridden by PARLEY_DB_PATH or DB_PATH.
    pub path: Option<PathBuf>,
}

/// Message filter defaults; can be replaced at runtime through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiltersConfig {
    #[serde(default = "default_accepted_types")]
    pub accepted_types: Vec<String>,
}

pub fn default_accepted_types() -> Vec<String> {
    vec!["text".to_string(), "chat".to_string()]
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            accepted_types: default_accepted_types(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Drop messages that arrive while the session is not connected.
    #[serde(default)]
    pub require_connected: bool,
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Look up `key` with `env`, ignoring blank values.
fn lookup<F>(env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(env(key).as_ref())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    resolve_telegram_token_with(config, process_env)
}

pub fn resolve_telegram_token_with<F>(config: &Config, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&env, "TELEGRAM_BOT_TOKEN")
        .or_else(|| non_empty(config.transport.telegram.bot_token.as_ref()))
}

/// Resolve the Gemini API key: env GEMINI_API_KEY overrides config.
pub fn resolve_gemini_api_key(config: &Config) -> Option<String> {
    resolve_gemini_api_key_with(config, process_env)
}

pub fn resolve_gemini_api_key_with<F>(config: &Config, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&env, "GEMINI_API_KEY").or_else(|| non_empty(config.generation.api_key.as_ref()))
}

/// Resolve the bridge secret: env PARLEY_BRIDGE_SECRET overrides config.
pub fn resolve_bridge_secret(config: &Config) -> Option<String> {
    resolve_bridge_secret_with(config, process_env)
}

pub fn resolve_bridge_secret_with<F>(config: &Config, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&env, "PARLEY_BRIDGE_SECRET")
        .or_else(|| non_empty(config.transport.bridge.secret.as_ref()))
}

/// Resolve the SQLite path: PARLEY_DB_PATH, then DB_PATH, then config, then ~/.parley/messages.db.
pub fn resolve_db_path(config: &Config) -> PathBuf {
    resolve_db_path_with(config, process_env)
}

pub fn resolve_db_path_with<F>(config: &Config, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&env, "PARLEY_DB_PATH")
        .or_else(|| lookup(&env, "DB_PATH"))
        .map(PathBuf::from)
        .or_else(|| config.storage.path.clone())
        .unwrap_or_else(|| parley_home().join("messages.db"))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

fn parley_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".parley"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| parley_home().join("config.json"))
}

/// Load config from the given path (or the default path). Missing file => default config.
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
