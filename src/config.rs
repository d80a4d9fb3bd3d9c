//! Runtime configuration for the delivery core.
//!
//! Every knob has a default, so an empty TOML document is a valid
//! configuration. Durations are stored as integer seconds or milliseconds
//! and exposed through `Duration` accessors.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Name stamped into the `source` field of every envelope.
    pub service_name: String,
    pub idempotency: IdempotencyConfig,
    pub breaker: BreakerConfig,
    pub worker: WorkerConfig,
    pub dlq: DlqConfig,
    pub destinations: DestinationsConfig,
    pub logging: LoggingConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            service_name: "delivery-core".to_string(),
            idempotency: IdempotencyConfig::default(),
            breaker: BreakerConfig::default(),
            worker: WorkerConfig::default(),
            dlq: DlqConfig::default(),
            destinations: DestinationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(invalid("service_name must not be empty"));
        }
        self.idempotency.validate()?;
        self.breaker.validate()?;
        self.worker.validate()?;
        self.dlq.validate()?;
        self.destinations.validate()
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Idempotency store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub key_prefix: String,
    pub default_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    /// Pause before the single re-check after losing the lock race.
    pub lock_retry_delay_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idempotency:".to_string(),
            default_ttl_secs: 24 * 60 * 60,
            lock_ttl_secs: 5 * 60,
            lock_retry_delay_ms: 100,
        }
    }
}

impl IdempotencyConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_secs == 0 {
            return Err(invalid("idempotency.default_ttl_secs must be positive"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(invalid("idempotency.lock_ttl_secs must be positive"));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds and breaker-cache bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub timeout_ms: u64,
    pub error_threshold_percentage: u32,
    pub reset_timeout_ms: u64,
    pub volume_threshold: u32,
    pub rolling_window_ms: u64,
    pub rolling_buckets: u32,
    /// Upper bound on the approximate memory held by cached breakers.
    pub cache_max_bytes: u64,
    /// Breakers unused for this long are evicted and shut down.
    pub cache_ttl_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            error_threshold_percentage: 50,
            reset_timeout_ms: 30_000,
            volume_threshold: 5,
            rolling_window_ms: 10_000,
            rolling_buckets: 10,
            cache_max_bytes: 1024 * 1024,
            cache_ttl_secs: 60 * 60,
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold_percentage > 100 {
            return Err(invalid(
                "breaker.error_threshold_percentage must be between 0 and 100",
            ));
        }
        if self.timeout_ms == 0 || self.reset_timeout_ms == 0 {
            return Err(invalid("breaker timeouts must be positive"));
        }
        if self.rolling_buckets == 0 || self.rolling_window_ms < u64::from(self.rolling_buckets) {
            return Err(invalid(
                "breaker.rolling_window_ms must cover at least one millisecond per bucket",
            ));
        }
        Ok(())
    }
}

/// Outbox worker, job scheduler and sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub job_name: String,
    pub concurrency: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub processing_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Pending rows older than this without an active job are re-enqueued.
    pub orphan_after_secs: u64,
    pub sweep_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "side-effects".to_string(),
            job_name: "process-side-effect".to_string(),
            concurrency: 10,
            rate_limit_max: 50,
            rate_limit_window_ms: 1_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            processing_timeout_secs: 5 * 60,
            sweep_interval_secs: 60,
            orphan_after_secs: 2 * 60,
            sweep_batch_size: 100,
        }
    }
}

impl WorkerConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn orphan_after(&self) -> Duration {
        Duration::from_secs(self.orphan_after_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("worker.concurrency must be at least 1"));
        }
        if self.rate_limit_max == 0 || self.rate_limit_window_ms == 0 {
            return Err(invalid("worker rate limit must allow at least one job per window"));
        }
        if self.max_retries == 0 {
            return Err(invalid("worker.max_retries must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(invalid("worker.backoff_base_ms must not exceed backoff_max_ms"));
        }
        if self.queue_name.trim().is_empty() || self.job_name.trim().is_empty() {
            return Err(invalid("worker queue and job names must not be empty"));
        }
        Ok(())
    }
}

/// Dead-letter inspection and replay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub replay_ttl_secs: u64,
    pub batch_size: usize,
    /// Visibility timeout used when peeking; 0 leaves messages visible.
    pub peek_visibility_timeout_secs: u64,
    /// Messages that fail to replay stay hidden for this long, so one
    /// replay run sees each message once. Must be positive.
    pub replay_visibility_timeout_secs: u64,
    pub mapping_cache_capacity: u64,
    pub mapping_cache_ttl_secs: u64,
    /// Main address -> dead-letter address, taking precedence over the
    /// naming convention.
    pub overrides: BTreeMap<String, String>,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            replay_ttl_secs: 24 * 60 * 60,
            batch_size: 10,
            peek_visibility_timeout_secs: 0,
            replay_visibility_timeout_secs: 30,
            mapping_cache_capacity: 256,
            mapping_cache_ttl_secs: 24 * 60 * 60,
            overrides: BTreeMap::new(),
        }
    }
}

impl DlqConfig {
    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.replay_ttl_secs)
    }

    pub fn peek_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.peek_visibility_timeout_secs)
    }

    pub fn replay_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.replay_visibility_timeout_secs)
    }

    pub fn mapping_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.mapping_cache_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 10 {
            return Err(invalid("dlq.batch_size must be between 1 and 10"));
        }
        if self.replay_ttl_secs == 0 {
            return Err(invalid("dlq.replay_ttl_secs must be positive"));
        }
        if self.replay_visibility_timeout_secs == 0 {
            return Err(invalid("dlq.replay_visibility_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Logical destination names mapped to provider addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationsConfig {
    pub queues: BTreeMap<String, DestinationEntry>,
    pub topics: BTreeMap<String, DestinationEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationEntry {
    pub address: String,
    /// Defaults to whether the address ends in `.fifo`.
    #[serde(default)]
    pub fifo: Option<bool>,
}

impl DestinationEntry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            fifo: None,
        }
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo.unwrap_or_else(|| self.address.ends_with(".fifo"))
    }
}

impl DestinationsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, entry) in self.queues.iter().chain(self.topics.iter()) {
            if entry.address.trim().is_empty() {
                return Err(invalid(format!("destination `{name}` has an empty address")));
            }
            if entry.fifo == Some(true) && !entry.address.ends_with(".fifo") {
                return Err(invalid(format!(
                    "FIFO destination `{name}` must use an address ending in .fifo"
                )));
            }
        }
        Ok(())
    }
}

/// Log output settings, consumed by `telemetry::init_tracing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}
