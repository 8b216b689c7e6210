//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file
//! - `--config <path>` on the command line

use anyhow::{Context, Result};
use relay_core::DelayConfig;
use relay_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream API configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Relayed stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Profile cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Upstream API configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the REST API (search, profiles).
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Base URL of the streaming API.
    #[serde(default = "default_stream_base")]
    pub stream_base: String,

    /// OAuth 1.0a user-context credentials used to sign every request.
    #[serde(default = "default_oauth")]
    pub oauth: Option<OAuthCredentials>,

    /// Bearer token sent when no OAuth credentials are configured.
    #[serde(default = "default_bearer_token")]
    pub bearer_token: Option<String>,

    /// Timeout for request/response calls in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// OAuth 1.0a consumer and access-token credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token_key: String,
    pub access_token_secret: String,
}

/// Relayed stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Search query tracked upstream.
    #[serde(default = "default_query")]
    pub query: String,

    /// Number of recent items replayed to new clients.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// Per-item delivery delay.
    #[serde(default)]
    pub delay: DelayConfig,
}

/// Profile cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached profiles.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Maximum age of a cached profile in seconds.
    #[serde(default = "default_cache_max_age")]
    pub max_age_secs: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding of items pushed to clients.
    #[serde(default)]
    pub encoding: Encoding,

    /// Origin allowed to make cross-origin requests.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081)
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    "https://api.twitter.com/1.1".to_string()
}

fn default_stream_base() -> String {
    "https://stream.twitter.com/1.1".to_string()
}

fn default_bearer_token() -> Option<String> {
    std::env::var("RELAY_BEARER_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
}

fn default_oauth() -> Option<OAuthCredentials> {
    OAuthCredentials::from_env()
}

fn default_request_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_query() -> String {
    std::env::var("RELAY_QUERY").unwrap_or_else(|_| "#codemash".to_string())
}

fn default_replay_capacity() -> usize {
    relay_core::replay::DEFAULT_REPLAY_CAPACITY
}

fn default_cache_capacity() -> usize {
    relay_core::cache::DEFAULT_CACHE_CAPACITY
}

fn default_cache_max_age() -> u64 {
    relay_core::cache::DEFAULT_CACHE_MAX_AGE.as_secs()
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_allowed_origin() -> String {
    std::env::var("RELAY_ORIGIN").unwrap_or_else(|_| "twitter-stream.dev".to_string())
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: UpstreamConfig::default(),
            stream: StreamConfig::default(),
            cache: CacheConfig::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            stream_base: default_stream_base(),
            oauth: default_oauth(),
            bearer_token: default_bearer_token(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("api_base", &self.api_base)
            .field("stream_base", &self.stream_base)
            .field("oauth", &self.oauth)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl OAuthCredentials {
    /// Read all four credentials from `RELAY_CONSUMER_KEY`,
    /// `RELAY_CONSUMER_SECRET`, `RELAY_ACCESS_TOKEN_KEY` and
    /// `RELAY_ACCESS_TOKEN_SECRET`. Returns `None` unless every one is set.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        Some(Self {
            consumer_key: var("RELAY_CONSUMER_KEY")?,
            consumer_secret: var("RELAY_CONSUMER_SECRET")?,
            access_token_key: var("RELAY_ACCESS_TOKEN_KEY")?,
            access_token_secret: var("RELAY_ACCESS_TOKEN_SECRET")?,
        })
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token_key", &self.access_token_key)
            .field("access_token_secret", &"<redacted>")
            .finish()
    }
}

impl UpstreamConfig {
    /// Request/response timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            replay_capacity: default_replay_capacity(),
            delay: DelayConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            max_age_secs: default_cache_max_age(),
        }
    }
}

impl CacheConfig {
    /// Freshness window of a cached profile.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            encoding: Encoding::default(),
            allowed_origin: default_allowed_origin(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit file, the default paths, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an explicit path cannot be read.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let path = path.to_string_lossy();
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
