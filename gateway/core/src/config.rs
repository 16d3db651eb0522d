//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - config: `$XDG_CONFIG_HOME/gateway/gateway.toml`
//! - history: `$XDG_DATA_HOME/gateway/history/`
//!
//! # Example Configuration
//!
//! ```toml
//! [gateway]
//! request_timeout_secs = 120
//! stream_idle_timeout_secs = 60
//! connect_timeout_ms = 10000
//! max_context_messages = 20
//! system_prompt = "You are concise."
//! max_tokens = 1024
//! temperature = 0.7
//! stream_persist_interval_ms = 2000
//!
//! [history]
//! dir = "/home/me/.local/share/gateway/history"
//!
//! [[providers]]
//! id = "openai"
//! model = "gpt-4o"
//!
//! [[providers]]
//! id = "local"
//! kind = "open_ai_compatible"
//! base_url = "http://127.0.0.1:8080/v1"
//! model = "qwen2.5"
//! api_key_env = "LOCAL_PROXY_KEY"
//! auth = { type = "bearer" }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::EnvCredentials;
use crate::history::HistoryStore;
use crate::provider::{ProviderEntry, ProviderRegistry, RegistryError};
use crate::request::GenerationParams;
use crate::streaming::DEFAULT_MAX_LINE_BYTES;
use crate::transport::TransportError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Provider entries do not form a valid registry
    #[error("Invalid provider configuration: {0}")]
    Registry(#[from] RegistryError),

    /// HTTP client could not be created
    #[error("Failed to create HTTP client: {0}")]
    HttpClient(#[from] TransportError),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[gateway]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Overall deadline per dispatch, seconds
    pub request_timeout_secs: Option<u64>,
    /// Deadline between two body reads, seconds
    pub stream_idle_timeout_secs: Option<u64>,
    /// TCP connect timeout, milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Prior messages passed as context (0 = all)
    pub max_context_messages: Option<usize>,
    /// System prompt sent with every dispatch
    pub system_prompt: Option<String>,
    /// Reply token limit (0 = provider default)
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Persist streaming messages this often, milliseconds (0 = only when done)
    pub stream_persist_interval_ms: Option<u64>,
    /// Longest accepted stream line, bytes
    pub max_line_bytes: Option<usize>,
    /// Buffered events per subscriber
    pub event_capacity: Option<usize>,
}

/// `[history]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Directory holding conversation files
    pub dir: Option<PathBuf>,
    /// Keep history in memory only
    pub in_memory: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigToml {
    /// Gateway section
    pub gateway: GatewayToml,
    /// History section
    pub history: HistoryToml,
    /// Provider entries
    pub providers: Vec<ProviderEntry>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective gateway configuration
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Overall deadline per dispatch
    pub request_timeout: Duration,
    /// Deadline between two body reads while streaming
    pub stream_idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Prior messages passed as context (0 = all)
    pub max_context_messages: usize,
    /// System prompt sent with every dispatch
    pub system_prompt: Option<String>,
    /// Sampling parameters
    pub generation: GenerationParams,
    /// Persist streaming messages this often (zero = only on terminal states)
    pub stream_persist_interval: Duration,
    /// Longest accepted stream line
    pub max_line_bytes: usize,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    /// History directory (`None` = in memory)
    pub history_dir: Option<PathBuf>,
    /// Provider entries layered over the built-in catalog
    pub providers: Vec<ProviderEntry>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_context_messages: 20,
            system_prompt: None,
            generation: GenerationParams::default(),
            stream_persist_interval: Duration::from_secs(2),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            event_capacity: 256,
            history_dir: default_history_dir(),
            providers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GATEWAY_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_config(&mut config);
        config
    }

    /// Defaults with in-memory history; for tests and embedding
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            history_dir: None,
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Set the overall dispatch deadline
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the idle deadline between body reads
    #[must_use]
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Set the streaming persistence interval
    #[must_use]
    pub fn with_stream_persist_interval(mut self, interval: Duration) -> Self {
        self.stream_persist_interval = interval;
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.generation.temperature
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.stream_idle_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Provider registry: built-in catalog plus configured entries
    pub fn registry(&self) -> Result<ProviderRegistry, ConfigError> {
        Ok(ProviderRegistry::from_entries(&self.providers)?)
    }

    /// Environment credential supplier honoring `api_key_env` overrides
    #[must_use]
    pub fn env_credentials(&self) -> EnvCredentials {
        self.providers
            .iter()
            .filter_map(|entry| Some((entry.id.clone(), entry.api_key_env.clone()?)))
            .fold(EnvCredentials::new(), |creds, (id, var)| {
                creds.with_var(id, var)
            })
    }

    /// History store at the configured location
    #[must_use]
    pub fn history_store(&self) -> HistoryStore {
        match &self.history_dir {
            Some(dir) => HistoryStore::on_disk(dir.clone()),
            None => HistoryStore::in_memory(),
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/gateway/gateway.toml` or
/// `~/.config/gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gateway").join("gateway.toml"))
}

/// Get the default history directory
#[must_use]
pub fn default_history_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("gateway").join("history"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values are out of range.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: ConfigToml) {
    let gateway = toml.gateway;
    if let Some(secs) = gateway.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = gateway.stream_idle_timeout_secs {
        config.stream_idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = gateway.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = gateway.max_context_messages {
        config.max_context_messages = n;
    }
    if gateway.system_prompt.is_some() {
        config.system_prompt = gateway.system_prompt;
    }
    if let Some(n) = gateway.max_tokens {
        config.generation.max_tokens = n;
    }
    if let Some(t) = gateway.temperature {
        config.generation.temperature = t;
    }
    if let Some(ms) = gateway.stream_persist_interval_ms {
        config.stream_persist_interval = Duration::from_millis(ms);
    }
    if let Some(n) = gateway.max_line_bytes {
        config.max_line_bytes = n;
    }
    if let Some(n) = gateway.event_capacity {
        config.event_capacity = n;
    }

    if toml.history.in_memory == Some(true) {
        config.history_dir = None;
    } else if toml.history.dir.is_some() {
        config.history_dir = toml.history.dir;
    }

    config.providers = toml.providers;
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig) {
    apply_env_with(config, |name| std::env::var(name).ok());
}

fn apply_env_with(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    let mut touched = false;
    let mut parsed = |name: &str| -> Option<String> {
        let value = lookup(name)?;
        touched = true;
        Some(value)
    };

    if let Some(secs) = parsed("GATEWAY_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parsed("GATEWAY_STREAM_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.stream_idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = parsed("GATEWAY_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = parsed("GATEWAY_MAX_CONTEXT_MESSAGES").and_then(|v| v.parse().ok()) {
        config.max_context_messages = n;
    }
    if let Some(prompt) = parsed("GATEWAY_SYSTEM_PROMPT") {
        config.system_prompt = Some(prompt).filter(|p| !p.is_empty());
    }
    if let Some(n) = parsed("GATEWAY_MAX_TOKENS").and_then(|v| v.parse().ok()) {
        config.generation.max_tokens = n;
    }
    if let Some(t) = parsed("GATEWAY_TEMPERATURE").and_then(|v| v.parse().ok()) {
        config.generation.temperature = t;
    }
    if let Some(dir) = parsed("GATEWAY_HISTORY_DIR") {
        config.history_dir = Some(PathBuf::from(dir));
    }
    if let Some(flag) = parsed("GATEWAY_HISTORY_IN_MEMORY") {
        if flag == "1" || flag.eq_ignore_ascii_case("true") {
            config.history_dir = None;
        }
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// History directory override
    pub history_dir: Option<PathBuf>,
    /// Keep history in memory
    pub in_memory_history: bool,
    /// Overall deadline override (seconds)
    pub request_timeout_secs: Option<u64>,
    /// System prompt override
    pub system_prompt: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set history directory override
    #[must_use]
    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.history_dir = Some(dir);
        self
    }

    /// Keep history in memory only
    #[must_use]
    pub fn with_in_memory_history(mut self) -> Self {
        self.in_memory_history = true;
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Set system prompt override
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.history_dir.is_some()
            || self.in_memory_history
            || self.request_timeout_secs.is_some()
            || self.system_prompt.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref dir) = self.history_dir {
            config.history_dir = Some(dir.clone());
        }
        if self.in_memory_history {
            config.history_dir = None;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ref prompt) = self.system_prompt {
            config.system_prompt = Some(prompt.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
