//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: GATEHOUSE_, `__` as section separator)
//! 2. Current working directory: ./gatehouse.toml
//! 3. Default values
//!
//! Connector definitions for the built-in static catalog live under
//! `[[connectors]]` tables in the same file.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::ApiKeyDefinition;
use crate::catalog::Connector;
use crate::error::Result;
use crate::respond::DEFAULT_PASSTHROUGH_HEADERS;
use crate::usage::UsageBufferConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Credential configuration for the built-in auth store
    #[serde(default)]
    pub auth: AuthConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Usage buffer configuration
    #[serde(default)]
    pub usage: UsageConfig,

    /// Upstream client configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Connector definitions for the static catalog
    #[serde(default)]
    pub connectors: Vec<Connector>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            port: default_port(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

/// Credentials accepted by the built-in auth store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// HS256 secret for session tokens; session auth is disabled when
    /// unset
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Declared API keys
    #[serde(default)]
    pub api_keys: Vec<ApiKeyDefinition>,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached responses
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Usage buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Bounded queue capacity; the oldest record is shed when full
    #[serde(default = "default_usage_queue_capacity")]
    pub queue_capacity: usize,

    /// Records per batch write
    #[serde(default = "default_usage_batch_size")]
    pub batch_size: usize,

    /// Flush interval in seconds
    #[serde(default = "default_usage_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Back-off before the single batch retry, in seconds
    #[serde(default = "default_usage_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Shutdown drain deadline in seconds
    #[serde(default = "default_usage_drain_deadline_secs")]
    pub drain_deadline_secs: u64,

    /// Append-only usage log path
    #[serde(default = "default_usage_log_path")]
    pub log_path: String,

    /// Optional region tag copied onto every usage record
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_usage_queue_capacity(),
            batch_size: default_usage_batch_size(),
            flush_interval_secs: default_usage_flush_interval_secs(),
            retry_delay_secs: default_usage_retry_delay_secs(),
            drain_deadline_secs: default_usage_drain_deadline_secs(),
            log_path: default_usage_log_path(),
            region: None,
        }
    }
}

impl UsageConfig {
    /// Buffer tuning derived from this config
    pub fn buffer_config(&self) -> UsageBufferConfig {
        UsageBufferConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            retry_delay: Duration::from_secs(self.retry_delay_secs.max(1)),
            drain_deadline: Duration::from_secs(self.drain_deadline_secs.max(1)),
        }
    }
}

/// Upstream client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Default per-attempt timeout when neither the endpoint nor the
    /// connector sets one
    #[serde(default = "default_upstream_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Initial retry back-off in milliseconds
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Retry back-off cap in milliseconds
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,

    /// Hard ceiling on buffered consumer request bodies, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Upstream response headers passed through to the consumer
    #[serde(default = "default_passthrough_headers")]
    pub passthrough_headers: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_upstream_timeout_ms(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            max_body_bytes: default_max_body_bytes(),
            passthrough_headers: default_passthrough_headers(),
        }
    }
}

impl UpstreamConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms.max(1))
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_cap_ms.max(self.retry_backoff_base_ms))
    }
}

impl Config {
    /// Load configuration from defaults, `gatehouse.toml`, and
    /// `GATEHOUSE_`-prefixed environment variables
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("gatehouse.toml"))
            .merge(Env::prefixed("GATEHOUSE_").split("__"))
            .extract()?;
        Ok(config)
    }
}

fn default_service_name() -> String {
    "gatehouse".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_usage_queue_capacity() -> usize {
    10_000
}

fn default_usage_batch_size() -> usize {
    50
}

fn default_usage_flush_interval_secs() -> u64 {
    5
}

fn default_usage_retry_delay_secs() -> u64 {
    1
}

fn default_usage_drain_deadline_secs() -> u64 {
    3
}

fn default_usage_log_path() -> String {
    "gatehouse-usage.jsonl".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_base_ms() -> u64 {
    100
}

fn default_retry_backoff_cap_ms() -> u64 {
    2_000
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_passthrough_headers() -> Vec<String> {
    DEFAULT_PASSTHROUGH_HEADERS
        .iter()
        .map(|s| s.to_string())
        .collect()
}
