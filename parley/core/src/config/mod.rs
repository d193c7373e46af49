//! TOML Configuration File Support
//!
//! Centralized configuration loading for parley, supporting a TOML file at
//! `~/.config/parley/parley.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`PARLEY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [matchmaker]
//! pair_timeout_ms = 5000
//! waiting_notice = "Waiting for a partner...\n"
//!
//! [bot]
//! reply_delay_ms = 1000
//! max_words = 10
//! max_pending_replies = 8
//!
//! [model]
//! order = 2
//! start_policy = "most_recent"
//!
//! [relay]
//! greeting = "Found one! Say hi.\n"
//! buffer_size = 4096
//!
//! [transport]
//! tcp_addr = "127.0.0.1:4001"
//! websocket_addr = "127.0.0.1:4000"
//! unix_socket = "/run/user/1000/parley.sock"
//! max_connections = 1000
//! ```
//!
//! An empty address string disables that listener.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markov::StartPolicy;

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
}

/// Tracks where a configuration value came from
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
// Runtime Configuration
// =============================================================================

/// Rendezvous settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchmakerConfig {
    /// How long an offered connection waits for a human before getting a bot
    pub pair_timeout: Duration,
    /// Written to each offered connection before it starts waiting
    pub waiting_notice: String,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            pair_timeout: Duration::from_secs(5),
            waiting_notice: "Waiting for a partner...\n".to_string(),
        }
    }
}

/// Synthetic partner settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotConfig {
    /// "Thinking" delay before each reply
    pub reply_delay: Duration,
    /// Upper bound on words per reply
    pub max_words: usize,
    /// Replies that may be waiting out their delay at once; writes arriving
    /// while this many are pending get no reply of their own
    pub max_pending_replies: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            reply_delay: Duration::from_secs(1),
            max_words: 10,
            max_pending_replies: 8,
        }
    }
}

/// Language model settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelConfig {
    /// Prefix length N
    pub order: usize,
    /// How generation picks its first prefix
    pub start_policy: StartPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            order: 2,
            start_policy: StartPolicy::MostRecent,
        }
    }
}

/// Session relay settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Sent to both sides when a session starts
    pub greeting: String,
    /// Copy buffer size per direction in bytes
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            greeting: "Found one! Say hi.\n".to_string(),
            buffer_size: 4096,
        }
    }
}

/// Listener settings (consumed by the daemon)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Raw TCP listen address (None = disabled)
    pub tcp_addr: Option<String>,
    /// WebSocket listen address (None = disabled)
    pub websocket_addr: Option<String>,
    /// Unix socket path (None = disabled)
    pub unix_socket: Option<PathBuf>,
    /// Maximum simultaneously open client connections
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_addr: Some("127.0.0.1:4001".to_string()),
            websocket_addr: Some("127.0.0.1:4000".to_string()),
            unix_socket: None,
            max_connections: 1000,
        }
    }
}

impl TransportConfig {
    /// Whether at least one listener is enabled
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.tcp_addr.is_some() || self.websocket_addr.is_some() || self.unix_socket.is_some()
    }
}

/// Complete configuration for the service
#[derive(Clone, Debug)]
pub struct ParleyConfig {
    /// Rendezvous settings
    pub matchmaker: MatchmakerConfig,
    /// Bot settings
    pub bot: BotConfig,
    /// Language model settings
    pub model: ModelConfig,
    /// Relay settings
    pub relay: RelayConfig,
    /// Listener settings
    pub transport: TransportConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            matchmaker: MatchmakerConfig::default(),
            bot: BotConfig::default(),
            model: ModelConfig::default(),
            relay: RelayConfig::default(),
            transport: TransportConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ParleyConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero model order, a bot
    /// that may never reply, a zero relay buffer, or when every listener is
    /// disabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.order == 0 {
            return Err(ConfigError::ValidationError(
                "model.order must be at least 1".to_string(),
            ));
        }
        if self.bot.max_pending_replies == 0 {
            return Err(ConfigError::ValidationError(
                "bot.max_pending_replies must be at least 1".to_string(),
            ));
        }
        if self.relay.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "relay.buffer_size must be at least 1".to_string(),
            ));
        }
        if !self.transport.has_listener() {
            return Err(ConfigError::ValidationError(
                "no listener enabled (tcp_addr, websocket_addr, unix_socket)".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Matchmaker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerToml {
    /// Pairing wait timeout in milliseconds
    pub pair_timeout_ms: Option<u64>,
    /// Notice written while waiting
    pub waiting_notice: Option<String>,
}

/// Bot section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotToml {
    /// Reply delay in milliseconds
    pub reply_delay_ms: Option<u64>,
    /// Maximum words per reply
    pub max_words: Option<usize>,
    /// Maximum replies in flight per bot
    pub max_pending_replies: Option<usize>,
}

/// Model section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelToml {
    /// Markov prefix order N
    pub order: Option<usize>,
    /// Generation start policy
    pub start_policy: Option<StartPolicy>,
}

/// Relay section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Session greeting
    pub greeting: Option<String>,
    /// Copy buffer size in bytes
    pub buffer_size: Option<usize>,
}

/// Transport section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Raw TCP listen address ("" disables)
    pub tcp_addr: Option<String>,
    /// WebSocket listen address ("" disables)
    pub websocket_addr: Option<String>,
    /// Unix socket path ("" disables)
    pub unix_socket: Option<String>,
    /// Connection limit
    pub max_connections: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyToml {
    /// Matchmaker section
    pub matchmaker: MatchmakerToml,
    /// Bot section
    pub bot: BotToml,
    /// Model section
    pub model: ModelToml,
    /// Relay section
    pub relay: RelayToml,
    /// Transport section
    pub transport: TransportToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/parley/parley.toml` or
/// `~/.config/parley/parley.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("parley.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ParleyConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ParleyConfig, ConfigError> {
    let mut config = ParleyConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ParleyToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
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

    Ok(config)
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ParleyConfig, toml: &ParleyToml) {
    if let Some(ms) = toml.matchmaker.pair_timeout_ms {
        config.matchmaker.pair_timeout = Duration::from_millis(ms);
    }
    if let Some(ref notice) = toml.matchmaker.waiting_notice {
        config.matchmaker.waiting_notice = notice.clone();
    }

    if let Some(ms) = toml.bot.reply_delay_ms {
        config.bot.reply_delay = Duration::from_millis(ms);
    }
    if let Some(words) = toml.bot.max_words {
        config.bot.max_words = words;
    }
    if let Some(pending) = toml.bot.max_pending_replies {
        config.bot.max_pending_replies = pending;
    }

    if let Some(order) = toml.model.order {
        config.model.order = order;
    }
    if let Some(policy) = toml.model.start_policy {
        config.model.start_policy = policy;
    }

    if let Some(ref greeting) = toml.relay.greeting {
        config.relay.greeting = greeting.clone();
    }
    if let Some(size) = toml.relay.buffer_size {
        config.relay.buffer_size = size;
    }

    if let Some(ref addr) = toml.transport.tcp_addr {
        config.transport.tcp_addr = non_empty(addr);
    }
    if let Some(ref addr) = toml.transport.websocket_addr {
        config.transport.websocket_addr = non_empty(addr);
    }
    if let Some(ref path) = toml.transport.unix_socket {
        config.transport.unix_socket = non_empty(path).map(PathBuf::from);
    }
    if let Some(max) = toml.transport.max_connections {
        config.transport.max_connections = max;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ParleyConfig) {
    if let Ok(timeout) = std::env::var("PARLEY_PAIR_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.matchmaker.pair_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(delay) = std::env::var("PARLEY_BOT_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.bot.reply_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(words) = std::env::var("PARLEY_BOT_MAX_WORDS") {
        if let Ok(n) = words.parse::<usize>() {
            config.bot.max_words = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(pending) = std::env::var("PARLEY_BOT_MAX_PENDING") {
        if let Ok(n) = pending.parse::<usize>() {
            config.bot.max_pending_replies = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(order) = std::env::var("PARLEY_MODEL_ORDER") {
        if let Ok(n) = order.parse::<usize>() {
            config.model.order = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(policy) = std::env::var("PARLEY_START_POLICY") {
        match policy.parse::<StartPolicy>() {
            Ok(p) => {
                config.model.start_policy = p;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring PARLEY_START_POLICY"),
        }
    }
    if let Ok(addr) = std::env::var("PARLEY_TCP_ADDR") {
        config.transport.tcp_addr = non_empty(&addr);
        config.source = ConfigSource::Env;
    }
    if let Ok(addr) = std::env::var("PARLEY_WS_ADDR") {
        config.transport.websocket_addr = non_empty(&addr);
        config.source = ConfigSource::Env;
    }
    if let Ok(path) = std::env::var("PARLEY_SOCKET") {
        config.transport.unix_socket = non_empty(&path).map(PathBuf::from);
        config.source = ConfigSource::Env;
    }
    if let Ok(max) = std::env::var("PARLEY_MAX_CONNECTIONS") {
        if let Ok(n) = max.parse::<usize>() {
            config.transport.max_connections = n;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Pairing timeout override
    pub pair_timeout: Option<Duration>,
    /// Waiting notice override
    pub waiting_notice: Option<String>,
    /// Bot reply delay override
    pub reply_delay: Option<Duration>,
    /// Bot max words override
    pub max_words: Option<usize>,
    /// Bot in-flight reply limit override
    pub max_pending_replies: Option<usize>,
    /// Markov order override
    pub order: Option<usize>,
    /// Start policy override
    pub start_policy: Option<StartPolicy>,
    /// Session greeting override
    pub greeting: Option<String>,
    /// Relay buffer size override
    pub buffer_size: Option<usize>,
    /// TCP listen address override ("" disables)
    pub tcp_addr: Option<String>,
    /// WebSocket listen address override ("" disables)
    pub websocket_addr: Option<String>,
    /// Unix socket path override (empty disables)
    pub unix_socket: Option<PathBuf>,
    /// Connection limit override
    pub max_connections: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pairing timeout override
    #[must_use]
    pub fn with_pair_timeout(mut self, timeout: Duration) -> Self {
        self.pair_timeout = Some(timeout);
        self
    }

    /// Set waiting notice override
    #[must_use]
    pub fn with_waiting_notice(mut self, notice: String) -> Self {
        self.waiting_notice = Some(notice);
        self
    }

    /// Set bot reply delay override
    #[must_use]
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    /// Set bot max words override
    #[must_use]
    pub fn with_max_words(mut self, words: usize) -> Self {
        self.max_words = Some(words);
        self
    }

    /// Set bot in-flight reply limit override
    #[must_use]
    pub fn with_max_pending_replies(mut self, pending: usize) -> Self {
        self.max_pending_replies = Some(pending);
        self
    }

    /// Set Markov order override
    #[must_use]
    pub fn with_order(mut self, order: usize) -> Self {
        self.order = Some(order);
        self
    }

    /// Set start policy override
    #[must_use]
    pub fn with_start_policy(mut self, policy: StartPolicy) -> Self {
        self.start_policy = Some(policy);
        self
    }

    /// Set session greeting override
    #[must_use]
    pub fn with_greeting(mut self, greeting: String) -> Self {
        self.greeting = Some(greeting);
        self
    }

    /// Set relay buffer size override
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set TCP listen address override
    #[must_use]
    pub fn with_tcp_addr(mut self, addr: String) -> Self {
        self.tcp_addr = Some(addr);
        self
    }

    /// Set WebSocket listen address override
    #[must_use]
    pub fn with_websocket_addr(mut self, addr: String) -> Self {
        self.websocket_addr = Some(addr);
        self
    }

    /// Set Unix socket path override
    #[must_use]
    pub fn with_unix_socket(mut self, path: PathBuf) -> Self {
        self.unix_socket = Some(path);
        self
    }

    /// Set connection limit override
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    fn is_empty(&self) -> bool {
        self.pair_timeout.is_none()
            && self.waiting_notice.is_none()
            && self.reply_delay.is_none()
            && self.max_words.is_none()
            && self.max_pending_replies.is_none()
            && self.order.is_none()
            && self.start_policy.is_none()
            && self.greeting.is_none()
            && self.buffer_size.is_none()
            && self.tcp_addr.is_none()
            && self.websocket_addr.is_none()
            && self.unix_socket.is_none()
            && self.max_connections.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ParleyConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(timeout) = self.pair_timeout {
            config.matchmaker.pair_timeout = timeout;
        }
        if let Some(ref notice) = self.waiting_notice {
            config.matchmaker.waiting_notice = notice.clone();
        }
        if let Some(delay) = self.reply_delay {
            config.bot.reply_delay = delay;
        }
        if let Some(words) = self.max_words {
            config.bot.max_words = words;
        }
        if let Some(pending) = self.max_pending_replies {
            config.bot.max_pending_replies = pending;
        }
        if let Some(order) = self.order {
            config.model.order = order;
        }
        if let Some(policy) = self.start_policy {
            config.model.start_policy = policy;
        }
        if let Some(ref greeting) = self.greeting {
            config.relay.greeting = greeting.clone();
        }
        if let Some(size) = self.buffer_size {
            config.relay.buffer_size = size;
        }
        if let Some(ref addr) = self.tcp_addr {
            config.transport.tcp_addr = non_empty(addr);
        }
        if let Some(ref addr) = self.websocket_addr {
            config.transport.websocket_addr = non_empty(addr);
        }
        if let Some(ref path) = self.unix_socket {
            config.transport.unix_socket =
                non_empty(&path.to_string_lossy()).map(PathBuf::from);
        }
        if let Some(max) = self.max_connections {
            config.transport.max_connections = max;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ParleyConfig::default();

        assert_eq!(config.matchmaker.pair_timeout, Duration::from_secs(5));
        assert_eq!(config.bot.reply_delay, Duration::from_secs(1));
        assert_eq!(config.bot.max_words, 10);
        assert_eq!(config.model.order, 2);
        assert_eq!(config.model.start_policy, StartPolicy::MostRecent);
        assert_eq!(config.relay.greeting, "Found one! Say hi.\n");
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("parley"));
            assert!(p.to_string_lossy().ends_with("parley.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let toml_content = r#"
[matchmaker]
pair_timeout_ms = 2500
waiting_notice = "hold on\n"

[bot]
reply_delay_ms = 250
max_pending_replies = 3

[model]
order = 3
start_policy = "random"

[relay]
buffer_size = 1024

[transport]
websocket_addr = ""
unix_socket = "/tmp/parley-test.sock"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.matchmaker.pair_timeout, Duration::from_millis(2500));
        assert_eq!(config.matchmaker.waiting_notice, "hold on\n");
        assert_eq!(config.bot.reply_delay, Duration::from_millis(250));
        assert_eq!(config.bot.max_pending_replies, 3);
        assert_eq!(config.model.order, 3);
        assert_eq!(config.model.start_policy, StartPolicy::Random);
        assert_eq!(config.relay.buffer_size, 1024);
        assert_eq!(config.transport.websocket_addr, None);
        assert_eq!(
            config.transport.unix_socket,
            Some(PathBuf::from("/tmp/parley-test.sock"))
        );
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[relay]\ngreeting = \"hi!\\n\"\n").unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.relay.greeting, "hi!\n");
        assert_eq!(config.relay.buffer_size, 4096);
        assert_eq!(config.matchmaker.pair_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[model\norder = ").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_start_policy_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[model]\nstart_policy = \"whatever\"\n")
            .unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/parley.toml"))).unwrap();
        assert_eq!(config.config_file_path, None);
        assert_eq!(config.relay.buffer_size, 4096);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[transport]\nmax_connections = 10\n")
            .unwrap();

        std::env::set_var("PARLEY_MAX_CONNECTIONS", "42");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        std::env::remove_var("PARLEY_MAX_CONNECTIONS");

        assert_eq!(config.transport.max_connections, 42);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    // =========================================================================
    // Validation and Override Tests
    // =========================================================================

    #[test]
    fn test_validation_errors() {
        let mut config = ParleyConfig::default();
        config.model.order = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ParleyConfig::default();
        config.relay.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ParleyConfig::default();
        config.bot.max_pending_replies = 0;
        assert!(config.validate().is_err());

        let mut config = ParleyConfig::default();
        config.transport = TransportConfig {
            tcp_addr: None,
            websocket_addr: None,
            unix_socket: None,
            max_connections: 1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ParleyConfig::default();
        let overrides = ConfigOverrides::new()
            .with_pair_timeout(Duration::from_millis(100))
            .with_max_words(3)
            .with_order(1)
            .with_start_policy(StartPolicy::Random)
            .with_tcp_addr(String::new());

        overrides.apply(&mut config);

        assert_eq!(config.matchmaker.pair_timeout, Duration::from_millis(100));
        assert_eq!(config.bot.max_words, 3);
        assert_eq!(config.model.order, 1);
        assert_eq!(config.model.start_policy, StartPolicy::Random);
        assert_eq!(config.transport.tcp_addr, None);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_socket_override_disables_listener() {
        let mut config = ParleyConfig::default();
        config.transport.unix_socket = Some(PathBuf::from("/tmp/parley.sock"));

        ConfigOverrides::new()
            .with_unix_socket(PathBuf::new())
            .apply(&mut config);

        assert_eq!(config.transport.unix_socket, None);
    }

    #[test]
    fn test_session_and_limit_overrides() {
        let mut config = ParleyConfig::default();
        ConfigOverrides::new()
            .with_waiting_notice("hang on\n".to_string())
            .with_greeting("go!\n".to_string())
            .with_buffer_size(512)
            .with_max_pending_replies(2)
            .with_max_connections(3)
            .apply(&mut config);

        assert_eq!(config.matchmaker.waiting_notice, "hang on\n");
        assert_eq!(config.relay.greeting, "go!\n");
        assert_eq!(config.relay.buffer_size, 512);
        assert_eq!(config.bot.max_pending_replies, 2);
        assert_eq!(config.transport.max_connections, 3);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = ParleyConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }
}
