//! Configuration file loading.
//!
//! Configuration is loaded from TOML with the following resolution order:
//! 1. an explicit path (e.g. `--config <path>`)
//! 2. `~/.orrery/config.toml` (user)
//! 3. `/etc/orrery/config.toml` (system)
//!
//! When no file exists, every setting takes its default. `ORRERY_REDIS_URL`
//! overrides `shared_cache.url`.
//!
//! ```toml
//! [cache]
//! max_entries = 10000
//!
//! [cache.ttl]
//! subject_secs = 7200
//! natal_chart_secs = 14400
//! transits_secs = 1800
//!
//! [shared_cache]
//! url = "redis://127.0.0.1:6379/0"
//!
//! [rate_limit]
//! capacity = 60
//! refill_per_second = 1.0
//!
//! [executor]
//! workers = 4
//! queue_capacity = 64
//! compute_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::admission::RateLimitConfig;
#[cfg(feature = "redis")]
use crate::cache::RedisStoreConfig;
use crate::cache::{LocalCacheConfig, SharedCacheConfig, TtlPolicy};
use crate::executor::ExecutorConfig;
use crate::{OrreryError, Result};

/// Environment variable overriding the shared cache URL.
pub const REDIS_URL_ENV: &str = "ORRERY_REDIS_URL";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub shared_cache: SharedCacheSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Local cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Maximum entries (default: 10000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Optional byte budget replacing the entry bound.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub ttl: TtlSection,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: None,
            ttl: TtlSection::default(),
        }
    }
}

fn default_max_entries() -> u64 {
    10_000
}

/// Per-operation TTLs in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlSection {
    #[serde(default = "default_subject_ttl")]
    pub subject_secs: u64,
    #[serde(default = "default_natal_chart_ttl")]
    pub natal_chart_secs: u64,
    #[serde(default = "default_transits_ttl")]
    pub transits_secs: u64,
}

impl Default for TtlSection {
    fn default() -> Self {
        Self {
            subject_secs: default_subject_ttl(),
            natal_chart_secs: default_natal_chart_ttl(),
            transits_secs: default_transits_ttl(),
        }
    }
}

fn default_subject_ttl() -> u64 {
    7200
}

fn default_natal_chart_ttl() -> u64 {
    14_400
}

fn default_transits_ttl() -> u64 {
    1800
}

/// Shared (L2) cache settings. No `url` means no shared cache.
#[derive(Debug, Clone, Deserialize)]
pub struct SharedCacheSection {
    #[serde(default)]
    pub url: Option<String>,
    /// Connections in the pool (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-operation timeout in milliseconds (default: 100).
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Budget for opening or checking out a connection, in milliseconds
    /// (default: 500).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pending background writes before new ones are dropped (default: 64).
    #[serde(default = "default_max_pending_writes")]
    pub max_pending_writes: usize,
}

impl Default for SharedCacheSection {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            op_timeout_ms: default_op_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_pending_writes: default_max_pending_writes(),
        }
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_op_timeout_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_max_pending_writes() -> usize {
    64
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    /// Set to false to admit everything (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill")]
    pub refill_per_second: f64,
    #[serde(default = "default_cost")]
    pub cost: f64,
    #[serde(default = "default_idle_horizon_secs")]
    pub idle_horizon_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_capacity(),
            refill_per_second: default_refill(),
            cost: default_cost(),
            idle_horizon_secs: default_idle_horizon_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> f64 {
    60.0
}

fn default_refill() -> f64 {
    1.0
}

fn default_cost() -> f64 {
    1.0
}

fn default_idle_horizon_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// Compute executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,
    /// Optional end-to-end budget for a caller, in seconds.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            compute_timeout_secs: default_compute_timeout_secs(),
            request_timeout_secs: None,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_compute_timeout_secs() -> u64 {
    30
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings, applied by binaries when installing a subscriber.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive (default: "info").
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, the first existing file
    /// of `~/.orrery/config.toml` and `/etc/orrery/config.toml` is used,
    /// falling back to defaults. Environment overrides are applied and the
    /// result validated.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_config_path(explicit_path)? {
            Some(path) => {
                let content = fs::read_to_string(&path).map_err(|e| {
                    OrreryError::Configuration(format!("Failed to read config file {path:?}: {e}"))
                })?;
                Self::from_toml_str(&content).map_err(|e| {
                    OrreryError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
                })?
            }
            None => Self::default(),
        };
        config.apply_overrides(std::env::var(REDIS_URL_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text. Does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrreryError::Configuration(e.to_string()))
    }

    /// Apply a shared cache URL override; blank values are ignored.
    pub fn apply_overrides(&mut self, redis_url: Option<String>) {
        if let Some(url) = redis_url.filter(|u| !u.trim().is_empty()) {
            self.shared_cache.url = Some(url);
        }
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(op) = self.ttl_policy().zero_ttl() {
            return Err(OrreryError::Configuration(format!("TTL for {op} must be non-zero")));
        }
        if self.cache.max_entries == 0 || self.cache.max_bytes == Some(0) {
            return Err(OrreryError::Configuration(
                "cache capacity must be non-zero".to_string(),
            ));
        }
        if self.shared_cache.op_timeout_ms == 0 {
            return Err(OrreryError::Configuration(
                "shared cache op timeout must be non-zero".to_string(),
            ));
        }
        if self.shared_cache.pool_size == 0 {
            return Err(OrreryError::Configuration(
                "shared cache pool size must be non-zero".to_string(),
            ));
        }
        if self.rate_limit.enabled {
            self.rate_limit_config()
                .validate()
                .map_err(OrreryError::Configuration)?;
        }
        self.executor_config()
            .validate()
            .map_err(OrreryError::Configuration)
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        let ttl = &self.cache.ttl;
        TtlPolicy {
            subject: Duration::from_secs(ttl.subject_secs),
            natal_chart: Duration::from_secs(ttl.natal_chart_secs),
            transits: Duration::from_secs(ttl.transits_secs),
        }
    }

    pub fn local_cache_config(&self) -> LocalCacheConfig {
        LocalCacheConfig {
            max_entries: self.cache.max_entries,
            max_bytes: self.cache.max_bytes,
        }
    }

    pub fn shared_cache_config(&self) -> SharedCacheConfig {
        SharedCacheConfig::new()
            .op_timeout(Duration::from_millis(self.shared_cache.op_timeout_ms))
            .max_pending_writes(self.shared_cache.max_pending_writes)
    }

    /// Redis connection settings, when a shared cache URL is configured.
    #[cfg(feature = "redis")]
    pub fn redis_store_config(&self) -> Option<RedisStoreConfig> {
        let section = &self.shared_cache;
        section.url.as_ref().map(|url| {
            RedisStoreConfig::new(url.clone())
                .pool_size(section.pool_size)
                .connect_timeout(Duration::from_millis(section.connect_timeout_ms))
        })
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let section = &self.rate_limit;
        RateLimitConfig::new()
            .capacity(section.capacity)
            .refill_per_second(section.refill_per_second)
            .cost(section.cost)
            .idle_horizon(Duration::from_secs(section.idle_horizon_secs))
            .sweep_interval(Duration::from_secs(section.sweep_interval_secs))
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new()
            .workers(self.executor.workers)
            .queue_capacity(self.executor.queue_capacity)
            .compute_timeout(Duration::from_secs(self.executor.compute_timeout_secs))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.executor.request_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve the config file path; `None` when no file exists.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(OrreryError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".orrery").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/orrery/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        let ttl = config.ttl_policy();
        assert_eq!(ttl.subject, Duration::from_secs(7200));
        assert_eq!(ttl.natal_chart, Duration::from_secs(14_400));
        assert_eq!(ttl.transits, Duration::from_secs(1800));
        assert_eq!(config.cache.max_entries, 10_000);
        assert!(config.shared_cache.url.is_none());
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.capacity, 60.0);
        assert_eq!(config.executor.workers, 4);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_minimal_config() {
        let config = Config::from_toml_str(
            r#"
            [executor]
            workers = 8
        "#,
        )
        .unwrap();
        assert_eq!(config.executor.workers, 8);
        // Defaults preserved
        assert_eq!(config.executor.queue_capacity, 64);
        assert_eq!(config.cache.ttl.subject_secs, 7200);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            max_entries = 500
            max_bytes = 1048576

            [cache.ttl]
            subject_secs = 60
            natal_chart_secs = 120
            transits_secs = 30

            [shared_cache]
            url = "redis://cache:6379/1"
            pool_size = 2
            op_timeout_ms = 50

            [rate_limit]
            enabled = false
            capacity = 10
            refill_per_second = 0.5

            [executor]
            workers = 2
            queue_capacity = 16
            compute_timeout_secs = 5
            request_timeout_secs = 10

            [logging]
            level = "debug"
            format = "json"
        "#,
        )
        .unwrap();
        assert_eq!(config.cache.max_bytes, Some(1_048_576));
        assert_eq!(config.ttl_policy().transits, Duration::from_secs(30));
        assert_eq!(config.shared_cache.url.as_deref(), Some("redis://cache:6379/1"));
        assert_eq!(
            config.shared_cache_config().op_timeout,
            Duration::from_millis(50)
        );
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit_config().refill_per_second, 0.5);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = Config::from_toml_str(
            r#"
            [cache.ttl]
            transits_secs = 0
        "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transits"));
    }

    #[test]
    fn disabled_rate_limit_skips_its_validation() {
        let mut config = Config::default();
        config.rate_limit.refill_per_second = 0.0;
        assert!(config.validate().is_err());
        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_replaces_url() {
        let mut config = Config::default();
        config.apply_overrides(Some("redis://override:6379".to_string()));
        assert_eq!(config.shared_cache.url.as_deref(), Some("redis://override:6379"));
        config.apply_overrides(Some("  ".to_string()));
        assert_eq!(config.shared_cache.url.as_deref(), Some("redis://override:6379"));
    }

    #[test]
    fn unknown_log_format_fails_to_parse() {
        let result = Config::from_toml_str(
            r#"
            [logging]
            format = "xml"
        "#,
        );
        assert!(result.is_err());
    }
}
