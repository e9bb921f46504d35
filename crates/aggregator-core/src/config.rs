//! Configuration loading and typed config structures for the aggregator.
//!
//! The canonical configuration lives in `aggregator-config.yaml` next to
//! the binary. Every field has a default, so a missing file or an empty
//! document yields a working in-memory setup with the local historian.
//!
//! Environment variables override selected values after parsing:
//!
//! | Variable          | Overrides                     |
//! |-------------------|-------------------------------|
//! | `HISTORIAN_URL`   | `historian.url`               |
//! | `TEMPHISTORIAN`   | `historian.url` (legacy name) |
//! | `DATABASE_URL`    | `infrastructure.postgres_url` |
//! | `AGGREGATOR_PORT` | `server.port`                 |

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use aggregator_store::PoolSettings;
use serde::Deserialize;
use tracing::warn;

use crate::coordinator::{AGGREGATE_ENTITY, CoordinatorConfig, ResolutionPolicy};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level aggregator configuration.
///
/// Mirrors the structure of `aggregator-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AggregatorConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Historian retry schedule.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Historian location.
    #[serde(default)]
    pub historian: HistorianConfig,

    /// Reading validation.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Optimistic-concurrency settings for the shared record backend.
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Shared record database and its pool.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AggregatorConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    /// Environment overrides apply in both cases.
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file) when the file exists.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string. No environment overrides
    /// are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Override values with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Override values from an arbitrary variable source.
    ///
    /// `HISTORIAN_URL` takes precedence over `TEMPHISTORIAN`. An
    /// `AGGREGATOR_PORT` that is not a valid port is ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HISTORIAN_URL").or_else(|| lookup("TEMPHISTORIAN")) {
            self.historian.url = Some(url);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.infrastructure.postgres_url = Some(url);
        }
        if let Some(port) = lookup("AGGREGATOR_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %port, "ignoring invalid AGGREGATOR_PORT"),
            }
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Retry schedule for historian calls.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential backoff, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on any single delay, in milliseconds.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Random extra wait as a fraction of the delay (0 disables jitter).
    #[serde(default)]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: None,
            jitter_ratio: 0.0,
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy.
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_jitter(self.jitter_ratio);
        match self.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

/// Historian configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistorianConfig {
    /// Base URL of a remote historian. When unset the in-process historian
    /// is used.
    #[serde(default)]
    pub url: Option<String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl HistorianConfig {
    /// Per-request timeout as a [`Duration`].
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Reading validation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipelineConfig {
    /// Device types accepted by `submit`.
    #[serde(default = "default_supported_device_types")]
    pub supported_device_types: BTreeSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supported_device_types: default_supported_device_types(),
        }
    }
}

/// Conflict resolution policy names as written in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    /// Recompute and retry once.
    #[default]
    RetryOnce,
    /// Abandon on the first conflict.
    ReportOnly,
    /// Recompute and retry up to `max_retries` times.
    RetryUpTo,
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinatorSettings {
    /// Resolution policy.
    #[serde(default)]
    pub policy: PolicyName,

    /// Retry budget for `retry_up_to`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Entity tags whose conflicts may be resolved.
    #[serde(default = "default_supported_entities")]
    pub supported_entities: BTreeSet<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            policy: PolicyName::default(),
            max_retries: default_max_retries(),
            supported_entities: default_supported_entities(),
        }
    }
}

impl CoordinatorSettings {
    /// The runtime resolution policy.
    pub const fn resolution_policy(&self) -> ResolutionPolicy {
        match self.policy {
            PolicyName::RetryOnce => ResolutionPolicy::RetryOnce,
            PolicyName::ReportOnly => ResolutionPolicy::ReportOnly,
            PolicyName::RetryUpTo => ResolutionPolicy::RetryUpTo(self.max_retries),
        }
    }

    /// Build the runtime coordinator configuration.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            policy: self.resolution_policy(),
            supported_entities: self.supported_entities.clone(),
        }
    }
}

/// Shared record database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// `PostgreSQL` connection string for the shared record backend. When
    /// unset, aggregates are kept in process memory only.
    #[serde(default)]
    pub postgres_url: Option<String>,

    /// Pool size.
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: u32,

    /// Wait for a free connection, in milliseconds.
    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub pool_acquire_timeout_ms: u64,

    /// Idle connection lifetime, in milliseconds.
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            pool_max_connections: default_pool_max_connections(),
            pool_acquire_timeout_ms: default_pool_acquire_timeout_ms(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
        }
    }
}

impl InfrastructureConfig {
    /// Connection pool settings for the record database.
    pub const fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.pool_max_connections,
            acquire_timeout: Duration::from_millis(self.pool_acquire_timeout_ms),
            idle_timeout: Duration::from_millis(self.pool_idle_timeout_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when
    /// set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8080
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_supported_device_types() -> BTreeSet<String> {
    BTreeSet::from(["TEMP".to_owned()])
}

const fn default_max_retries() -> u32 {
    3
}

fn default_supported_entities() -> BTreeSet<String> {
    BTreeSet::from([AGGREGATE_ENTITY.to_owned()])
}

const fn default_pool_max_connections() -> u32 {
    10
}

const fn default_pool_acquire_timeout_ms() -> u64 {
    5_000
}

const fn default_pool_idle_timeout_ms() -> u64 {
    300_000
}

fn default_log_level() -> String {
    "info".to_owned()
}
