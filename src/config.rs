//! Configuration for the cache queue.
//!
//! Covers the Redis endpoint, connection pool sizing, per-business default
//! block sizes and the consumed-block counter strategy. Configuration can be
//! built in code, loaded from YAML, or read from `CACHE_QUEUE_*` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::processor::DEFAULT_BLOCK_SIZE;
use crate::queue::ConsumeCounter;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Redis endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections handed out at once.
    pub max_total: usize,
    /// Maximum number of idle connections kept for reuse.
    pub max_idle: usize,
    /// Connections opened eagerly by `RedisPool::warm_up`.
    pub min_idle: usize,
    /// How long `acquire` waits for a free connection.
    pub max_wait_ms: u64,
    /// Timeout for establishing a new connection.
    pub connect_timeout_ms: u64,
    /// Timeout applied to every individual command.
    pub command_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait_ms: 5_000,
            connect_timeout_ms: 10_000,
            command_timeout_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Caps `max_idle` at `max_total` and `min_idle` at the resulting
    /// `max_idle`.
    pub fn clamped(mut self) -> Self {
        self.max_idle = self.max_idle.min(self.max_total);
        self.min_idle = self.min_idle.min(self.max_idle);
        self
    }
}

/// Per-business default block size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BizConfig {
    pub biz_id: String,
    pub block_size: usize,
}

/// Top-level cache queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheQueueConfig {
    pub redis: RedisConfig,
    pub pool: PoolConfig,
    pub biz: Vec<BizConfig>,
    /// Block size used for business streams without an explicit entry.
    pub default_block_size: usize,
    pub counter_mode: ConsumeCounter,
}

impl Default for CacheQueueConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            pool: PoolConfig::default(),
            biz: Vec::new(),
            default_block_size: DEFAULT_BLOCK_SIZE,
            counter_mode: ConsumeCounter::default(),
        }
    }
}

impl CacheQueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.clamp_idle();
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CACHE_QUEUE_REDIS_HOST`: Redis host (default: localhost)
    /// - `CACHE_QUEUE_REDIS_PORT`: Redis port (default: 6379)
    /// - `CACHE_QUEUE_REDIS_PASSWORD`: Redis password (default: none)
    /// - `CACHE_QUEUE_REDIS_DB`: Redis database index (default: 0)
    /// - `CACHE_QUEUE_POOL_MAX_TOTAL`: Maximum pooled connections (default: 8)
    /// - `CACHE_QUEUE_POOL_MAX_IDLE`: Maximum idle connections, capped at max total (default: 8)
    /// - `CACHE_QUEUE_POOL_MIN_IDLE`: Connections opened on warm-up (default: 0)
    /// - `CACHE_QUEUE_POOL_MAX_WAIT_MS`: Acquire timeout (default: 5000)
    /// - `CACHE_QUEUE_POOL_CONNECT_TIMEOUT_MS`: Connect timeout (default: 10000)
    /// - `CACHE_QUEUE_POOL_COMMAND_TIMEOUT_MS`: Per-command timeout (default: 60000)
    /// - `CACHE_QUEUE_DEFAULT_BLOCK_SIZE`: Fallback block size (default: 100)
    /// - `CACHE_QUEUE_BIZ`: Per-business block sizes, e.g. `orders:50,emails:200`
    /// - `CACHE_QUEUE_ATOMIC_COUNTER`: Use atomic consumed-block increments (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Redis settings
        if let Some(val) = lookup("CACHE_QUEUE_REDIS_HOST") {
            config.redis.host = val;
        }

        if let Some(val) = lookup("CACHE_QUEUE_REDIS_PORT") {
            config.redis.port = parse_env_value(&val, "CACHE_QUEUE_REDIS_PORT")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_REDIS_PASSWORD") {
            if !val.is_empty() {
                config.redis.password = Some(val);
            }
        }

        if let Some(val) = lookup("CACHE_QUEUE_REDIS_DB") {
            config.redis.db = parse_env_value(&val, "CACHE_QUEUE_REDIS_DB")?;
        }

        // Pool settings
        if let Some(val) = lookup("CACHE_QUEUE_POOL_MAX_TOTAL") {
            config.pool.max_total = parse_env_value(&val, "CACHE_QUEUE_POOL_MAX_TOTAL")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_POOL_MAX_IDLE") {
            config.pool.max_idle = parse_env_value(&val, "CACHE_QUEUE_POOL_MAX_IDLE")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_POOL_MIN_IDLE") {
            config.pool.min_idle = parse_env_value(&val, "CACHE_QUEUE_POOL_MIN_IDLE")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_POOL_MAX_WAIT_MS") {
            config.pool.max_wait_ms = parse_env_value(&val, "CACHE_QUEUE_POOL_MAX_WAIT_MS")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_POOL_CONNECT_TIMEOUT_MS") {
            config.pool.connect_timeout_ms =
                parse_env_value(&val, "CACHE_QUEUE_POOL_CONNECT_TIMEOUT_MS")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_POOL_COMMAND_TIMEOUT_MS") {
            config.pool.command_timeout_ms =
                parse_env_value(&val, "CACHE_QUEUE_POOL_COMMAND_TIMEOUT_MS")?;
        }

        // Queue settings
        if let Some(val) = lookup("CACHE_QUEUE_DEFAULT_BLOCK_SIZE") {
            config.default_block_size = parse_env_value(&val, "CACHE_QUEUE_DEFAULT_BLOCK_SIZE")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_BIZ") {
            config.biz = parse_biz_list(&val, "CACHE_QUEUE_BIZ")?;
        }

        if let Some(val) = lookup("CACHE_QUEUE_ATOMIC_COUNTER") {
            config.counter_mode = if parse_env_bool(&val, "CACHE_QUEUE_ATOMIC_COUNTER")? {
                ConsumeCounter::Atomic
            } else {
                ConsumeCounter::ReadModifyWrite
            };
        }

        config.clamp_idle();
        config.validate()?;
        Ok(config)
    }

    /// An unset `max_idle` follows a smaller `max_total`.
    fn clamp_idle(&mut self) {
        self.pool.max_idle = self.pool.max_idle.min(self.pool.max_total);
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis.host cannot be empty".to_string(),
            ));
        }

        if self.pool.max_total == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.max_total must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_idle > self.pool.max_total {
            return Err(ConfigError::ValidationFailed(
                "pool.max_idle cannot exceed pool.max_total".to_string(),
            ));
        }

        if self.pool.min_idle > self.pool.max_idle {
            return Err(ConfigError::ValidationFailed(
                "pool.min_idle cannot exceed pool.max_idle".to_string(),
            ));
        }

        if self.default_block_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_block_size must be greater than 0".to_string(),
            ));
        }

        if let Some(biz) = self.biz.iter().find(|b| b.block_size == 0) {
            return Err(ConfigError::ValidationFailed(format!(
                "block_size for biz '{}' must be greater than 0",
                biz.biz_id
            )));
        }

        Ok(())
    }

    /// Resolves the default block size for a business stream.
    pub fn block_size_for(&self, biz_id: &str) -> usize {
        self.biz
            .iter()
            .find(|b| b.biz_id == biz_id)
            .map(|b| b.block_size)
            .unwrap_or(self.default_block_size)
    }

    /// Builds the `redis://` connection URL, percent-encoding the password.
    pub fn redis_url(&self) -> String {
        let auth = match &self.redis.password {
            Some(password) => format!(":{}@", urlencoding::encode(password)),
            None => String::new(),
        };
        format!(
            "redis://{}{}:{}/{}",
            auth, self.redis.host, self.redis.port, self.redis.db
        )
    }

    /// Builder method to set the Redis host and port.
    pub fn with_redis_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.redis.host = host.into();
        self.redis.port = port;
        self
    }

    /// Builder method to set the Redis password.
    pub fn with_redis_password(mut self, password: impl Into<String>) -> Self {
        self.redis.password = Some(password.into());
        self
    }

    /// Builder method to set the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Builder method to register a per-business block size.
    pub fn with_biz(mut self, biz_id: impl Into<String>, block_size: usize) -> Self {
        self.biz.push(BizConfig {
            biz_id: biz_id.into(),
            block_size,
        });
        self
    }

    /// Builder method to set the fallback block size.
    pub fn with_default_block_size(mut self, block_size: usize) -> Self {
        self.default_block_size = block_size;
        self
    }

    /// Builder method to set the consumed-block counter strategy.
    pub fn with_counter_mode(mut self, mode: ConsumeCounter) -> Self {
        self.counter_mode = mode;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse `biz:size` pairs separated by commas.
fn parse_biz_list(value: &str, key: &str) -> Result<Vec<BizConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (biz_id, size) = entry.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'biz:block_size', got '{}'", entry),
            })?;
            Ok(BizConfig {
                biz_id: biz_id.trim().to_string(),
                block_size: parse_env_value(size, key)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CacheQueueConfig::default();

        assert_eq!(config.redis.host, "localhost");
        assert_eq!(config.redis.port, 6379);
        assert!(config.redis.password.is_none());
        assert_eq!(config.pool.max_total, 8);
        assert_eq!(config.pool.max_wait(), Duration::from_secs(5));
        assert_eq!(config.default_block_size, 100);
        assert_eq!(config.counter_mode, ConsumeCounter::ReadModifyWrite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = CacheQueueConfig::from_lookup(lookup_from(&[
            ("CACHE_QUEUE_REDIS_HOST", "redis.internal"),
            ("CACHE_QUEUE_REDIS_PORT", "6380"),
            ("CACHE_QUEUE_REDIS_PASSWORD", "s3cret"),
            ("CACHE_QUEUE_POOL_MAX_TOTAL", "16"),
            ("CACHE_QUEUE_POOL_MAX_IDLE", "4"),
            ("CACHE_QUEUE_BIZ", "orders:50, emails:200"),
            ("CACHE_QUEUE_ATOMIC_COUNTER", "yes"),
        ]))
        .expect("config should parse");

        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password.as_deref(), Some("s3cret"));
        assert_eq!(config.pool.max_total, 16);
        assert_eq!(config.pool.max_idle, 4);
        assert_eq!(config.block_size_for("orders"), 50);
        assert_eq!(config.block_size_for("emails"), 200);
        assert_eq!(config.block_size_for("unknown"), 100);
        assert_eq!(config.counter_mode, ConsumeCounter::Atomic);
    }

    #[test]
    fn test_from_env_invalid_values() {
        let err = CacheQueueConfig::from_lookup(lookup_from(&[("CACHE_QUEUE_REDIS_PORT", "abc")]))
            .unwrap_err();
        assert!(err.to_string().contains("CACHE_QUEUE_REDIS_PORT"));

        let err = CacheQueueConfig::from_lookup(lookup_from(&[("CACHE_QUEUE_BIZ", "orders")]))
            .unwrap_err();
        assert!(err.to_string().contains("biz:block_size"));

        let err =
            CacheQueueConfig::from_lookup(lookup_from(&[("CACHE_QUEUE_ATOMIC_COUNTER", "maybe")]))
                .unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_validation_failures() {
        let config = CacheQueueConfig::default().with_pool(PoolConfig {
            max_total: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = CacheQueueConfig::default().with_pool(PoolConfig {
            max_total: 2,
            max_idle: 4,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = CacheQueueConfig::default().with_pool(PoolConfig {
            min_idle: 5,
            max_idle: 2,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = CacheQueueConfig::default().with_default_block_size(0);
        assert!(config.validate().is_err());

        let config = CacheQueueConfig::default().with_biz("orders", 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_max_total_alone_caps_max_idle() {
        let config =
            CacheQueueConfig::from_lookup(lookup_from(&[("CACHE_QUEUE_POOL_MAX_TOTAL", "4")]))
                .expect("max_total alone should be accepted");
        assert_eq!(config.pool.max_total, 4);
        assert_eq!(config.pool.max_idle, 4);

        let config = CacheQueueConfig::from_yaml_str("pool:\n  max_total: 2\n")
            .expect("yaml with max_total alone should be accepted");
        assert_eq!(config.pool.max_total, 2);
        assert_eq!(config.pool.max_idle, 2);
    }

    #[test]
    fn test_pool_config_clamped() {
        let pool = PoolConfig {
            max_total: 2,
            max_idle: 6,
            min_idle: 5,
            ..Default::default()
        }
        .clamped();
        assert_eq!(pool.max_idle, 2);
        assert_eq!(pool.min_idle, 2);
    }

    #[test]
    fn test_redis_url() {
        let config = CacheQueueConfig::default();
        assert_eq!(config.redis_url(), "redis://localhost:6379/0");

        let config = CacheQueueConfig::default()
            .with_redis_endpoint("cache", 6380)
            .with_redis_password("p@ss word");
        assert_eq!(config.redis_url(), "redis://:p%40ss%20word@cache:6380/0");
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
redis:
  host: redis.example
  port: 6390
pool:
  max_total: 4
  max_idle: 2
biz:
  - biz_id: orders
    block_size: 25
counter_mode: atomic
"#;
        let config = CacheQueueConfig::from_yaml_str(yaml).expect("yaml should parse");

        assert_eq!(config.redis.host, "redis.example");
        assert_eq!(config.redis.port, 6390);
        assert_eq!(config.pool.max_total, 4);
        assert_eq!(config.pool.max_wait_ms, 5_000);
        assert_eq!(config.block_size_for("orders"), 25);
        assert_eq!(config.counter_mode, ConsumeCounter::Atomic);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache-queue.yaml");
        std::fs::write(&path, "default_block_size: 10\n").expect("write config");

        let config = CacheQueueConfig::from_yaml_file(&path).expect("file should load");
        assert_eq!(config.default_block_size, 10);

        let missing = CacheQueueConfig::from_yaml_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "TEST_KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("TEST_KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
