//! Builder for configuring gateway instances

use std::sync::Arc;
use std::time::Duration;

use super::ChartGateway;
use super::flight::SingleFlight;
use super::service::Inner;
use crate::admission::{RateLimitConfig, RateLimiter};
#[cfg(feature = "redis")]
use crate::cache::{RedisStore, RedisStoreConfig};
use crate::cache::{LocalCache, LocalCacheConfig, SharedCache, SharedCacheConfig, SharedStore, TtlPolicy};
use crate::calc::Calculator;
use crate::config::Config;
use crate::executor::{ComputeExecutor, ExecutorConfig};
use crate::stats::Counters;
use crate::types::Operation;
use crate::{OrreryError, Result};

/// Main entry point for creating gateway instances.
pub struct Orrery;

impl Orrery {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> OrreryBuilder {
        OrreryBuilder::new()
    }
}

/// Builder for configuring gateway instances.
///
/// ```rust,no_run
/// # use orrery::{MeanEphemeris, Orrery, ExecutorConfig};
/// # async fn example() -> orrery::Result<()> {
/// let gateway = Orrery::builder()
///     .calculator(MeanEphemeris::new())
///     .executor(ExecutorConfig::new().workers(8))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct OrreryBuilder {
    calculator: Option<Arc<dyn Calculator>>,
    ttl: TtlPolicy,
    local_cache: LocalCacheConfig,
    shared_store: Option<Arc<dyn SharedStore>>,
    shared_cache: SharedCacheConfig,
    #[cfg(feature = "redis")]
    redis: Option<RedisStoreConfig>,
    rate_limit: Option<RateLimitConfig>,
    executor: ExecutorConfig,
    request_timeout: Option<Duration>,
}

impl Default for OrreryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrreryBuilder {
    pub fn new() -> Self {
        Self {
            calculator: None,
            ttl: TtlPolicy::default(),
            local_cache: LocalCacheConfig::default(),
            shared_store: None,
            shared_cache: SharedCacheConfig::default(),
            #[cfg(feature = "redis")]
            redis: None,
            rate_limit: Some(RateLimitConfig::default()),
            executor: ExecutorConfig::default(),
            request_timeout: None,
        }
    }

    /// Apply every setting from a loaded [`Config`].
    ///
    /// The calculator still has to be set separately.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .ttl_policy(config.ttl_policy())
            .local_cache(config.local_cache_config())
            .shared_cache(config.shared_cache_config())
            .executor(config.executor_config());
        builder.rate_limit = config.rate_limit.enabled.then(|| config.rate_limit_config());
        builder.request_timeout = config.request_timeout();

        #[cfg(feature = "redis")]
        {
            builder.redis = config.redis_store_config();
        }
        #[cfg(not(feature = "redis"))]
        if config.shared_cache.url.is_some() {
            tracing::warn!("shared_cache.url is set but orrery was built without the redis feature");
        }

        builder
    }

    /// Set the calculator. Required.
    pub fn calculator(mut self, calculator: impl Calculator) -> Self {
        self.calculator = Some(Arc::new(calculator));
        self
    }

    /// Set an already shared calculator.
    pub fn shared_calculator(mut self, calculator: Arc<dyn Calculator>) -> Self {
        self.calculator = Some(calculator);
        self
    }

    /// Replace the whole TTL policy.
    pub fn ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl = policy;
        self
    }

    /// Set the TTL for one operation.
    pub fn ttl(mut self, operation: Operation, ttl: Duration) -> Self {
        self.ttl = self.ttl.with(operation, ttl);
        self
    }

    pub fn local_cache(mut self, config: LocalCacheConfig) -> Self {
        self.local_cache = config;
        self
    }

    /// Use `store` as the shared cache backend.
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    /// Timeouts and write cap for the shared cache.
    pub fn shared_cache(mut self, config: SharedCacheConfig) -> Self {
        self.shared_cache = config;
        self
    }

    /// Use Redis as the shared cache backend.
    ///
    /// Ignored when [`shared_store`](Self::shared_store) is also set.
    #[cfg(feature = "redis")]
    pub fn redis(mut self, config: RedisStoreConfig) -> Self {
        self.redis = Some(config);
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Admit every request.
    pub fn disable_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Bound how long a caller waits end to end. A caller that gives up
    /// only detaches; the computation continues and is cached.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the gateway.
    ///
    /// Must be called inside a tokio runtime: executor workers and the
    /// rate-bucket sweeper are spawned here.
    pub fn build(self) -> Result<ChartGateway> {
        let calculator = self.calculator.ok_or(OrreryError::NoCalculator)?;

        if let Some(op) = self.ttl.zero_ttl() {
            return Err(OrreryError::Configuration(format!(
                "TTL for {op} must be non-zero"
            )));
        }
        if self.local_cache.max_entries == 0 || self.local_cache.max_bytes == Some(0) {
            return Err(OrreryError::Configuration(
                "cache capacity must be non-zero".to_string(),
            ));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate().map_err(OrreryError::Configuration)?;
        }
        self.executor
            .validate()
            .map_err(OrreryError::Configuration)?;
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrreryError::Configuration(
                "request timeout must be non-zero".to_string(),
            ));
        }

        tokio::runtime::Handle::try_current().map_err(|_| {
            OrreryError::Configuration("the gateway must be built inside a tokio runtime".to_string())
        })?;

        #[cfg(feature = "redis")]
        let shared_store = match (self.shared_store, self.redis) {
            (Some(store), _) => Some(store),
            (None, Some(config)) => Some(Arc::new(RedisStore::new(config)?) as Arc<dyn SharedStore>),
            (None, None) => None,
        };
        #[cfg(not(feature = "redis"))]
        let shared_store = self.shared_store;

        let shared = shared_store.map(|store| SharedCache::new(store, &self.shared_cache));

        Ok(ChartGateway::new(Inner {
            calculator,
            ttl: self.ttl,
            local: LocalCache::new(&self.local_cache),
            shared,
            flights: SingleFlight::new(),
            limiter: self.rate_limit.map(RateLimiter::new),
            executor: ComputeExecutor::new(self.executor),
            request_timeout: self.request_timeout,
            counters: Counters::default(),
        }))
    }
}
