//! Redis-backed [`SharedStore`].
//!
//! Values are stored with `SET key value PX ttl` and read with a pipelined
//! `GET` + `PTTL`, so an L2 hit knows how long it has left.
//!
//! # Connections
//!
//! Connections come from a `deadpool_redis::Pool` of at most `pool_size`
//! connections, opened on demand. Creating a connection and waiting for a
//! free one are both bounded by `connect_timeout`, so an unreachable server
//! fails fast; [`SharedCache`](super::SharedCache) turns those failures
//! into misses.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, Runtime};
use tracing::debug;

use super::{CacheKey, SharedHit, SharedStore};
use crate::types::Payload;
use crate::{OrreryError, Result};

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Maximum connections in the pool. Default: 4.
    pub pool_size: usize,
    /// Budget for opening or checking out a connection. Default: 500ms.
    pub connect_timeout: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 4,
            connect_timeout: Duration::from_millis(500),
        }
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Shared store on a Redis server.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create a store. Parses the URL and sizes the pool; no connection is
    /// made until the first operation.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(config.url.as_str());
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size.max(1);
            pool_config.timeouts.create = Some(config.connect_timeout);
            pool_config.timeouts.wait = Some(config.connect_timeout);
            pool_config.timeouts.recycle = Some(config.connect_timeout);
        }

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| OrreryError::Configuration(format!("invalid redis config: {e}")))?;
        debug!(max_size = config.pool_size, "redis pool created");
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| OrreryError::CacheBackendUnavailable(format!("redis pool: {e}")))
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<SharedHit>> {
        let mut conn = self.connection().await?;
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(key.as_str())
            .pttl(key.as_str())
            .query_async(&mut conn)
            .await?;

        // PTTL: -1 no expiry, -2 missing (raced with expiry).
        Ok(value.map(|bytes| SharedHit {
            value: Payload::from(bytes),
            ttl_remaining: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn put(&self, key: &CacheKey, value: &Payload, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key.as_str())
            .arg(value.as_bytes())
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", CacheKey::PREFIX))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}
