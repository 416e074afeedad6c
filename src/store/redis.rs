//! Redis store over a bounded connection pool.
//!
//! The pool is an explicitly owned resource: callers construct a
//! [`RedisPool`] from configuration and hand it to a [`RedisStore`]. A
//! permit from a `tokio` semaphore bounds how many connections are out at
//! once; [`PooledConnection`] gives the connection back when dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::error::Elapsed;
use tracing::{debug, warn};

use super::{KvConnection, KvStore};
use crate::config::{CacheQueueConfig, PoolConfig};
use crate::error::StoreError;

struct PoolInner {
    client: ::redis::Client,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<MultiplexedConnection>>,
    config: PoolConfig,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StoreError> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.client.get_multiplexed_async_connection()).await {
            Ok(Ok(conn)) => {
                debug!("Opened new Redis connection");
                Ok(conn)
            }
            Ok(Err(e)) => Err(StoreError::Connect(e.to_string())),
            Err(_) => Err(StoreError::Connect(format!(
                "timed out after {:?}",
                timeout
            ))),
        }
    }

    fn release(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        }
    }
}

/// Bounded pool of Redis connections.
///
/// Cloning shares the same pool.
#[derive(Clone)]
pub struct RedisPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("max_total", &self.inner.config.max_total)
            .field("available", &self.available())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl RedisPool {
    /// Creates a pool for `redis_url`. No connection is opened until the
    /// first `acquire` or `warm_up`. Idle limits are capped with
    /// [`PoolConfig::clamped`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Redis` if the URL is invalid.
    pub fn new(redis_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url)?;
        let config = config.clamped();
        Ok(Self {
            inner: Arc::new(PoolInner {
                client,
                permits: Arc::new(Semaphore::new(config.max_total)),
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                config,
            }),
        })
    }

    /// Creates a pool from the queue configuration.
    pub fn from_config(config: &CacheQueueConfig) -> Result<Self, StoreError> {
        Self::new(&config.redis_url(), config.pool.clone())
    }

    /// Opens connections until `min_idle` are parked in the idle list.
    pub async fn warm_up(&self) -> Result<usize, StoreError> {
        let target = self.inner.config.min_idle;
        let missing = target.saturating_sub(self.idle_count());
        for _ in 0..missing {
            let conn = self.inner.connect().await?;
            self.inner.release(conn);
        }
        Ok(missing)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection, waiting up to `max_wait` for a free slot.
    ///
    /// # Errors
    ///
    /// - `StoreError::PoolTimeout` if no slot frees up in time
    /// - `StoreError::Connect` if a new connection cannot be opened
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let max_wait = self.inner.config.max_wait();
        let permit = tokio::time::timeout(max_wait, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| StoreError::PoolTimeout(max_wait))?
            .map_err(|_| StoreError::Connect("connection pool is closed".to_string()))?;

        let reused = self.inner.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.inner.connect().await?,
        };

        Ok(PooledConnection {
            conn,
            pool: Arc::clone(&self.inner),
            command_timeout: self.inner.config.command_timeout(),
            broken: false,
            _permit: permit,
        })
    }

    /// Number of connections that can still be handed out without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn max_total(&self) -> usize {
        self.inner.config.max_total
    }
}

/// A connection checked out of a [`RedisPool`].
///
/// Returned to the pool on drop unless a command failed in a way that
/// leaves the connection unusable.
pub struct PooledConnection {
    conn: MultiplexedConnection,
    pool: Arc<PoolInner>,
    command_timeout: Duration,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn finish<T>(&mut self, result: Result<RedisResult<T>, Elapsed>) -> Result<T, StoreError> {
        let outcome = match result {
            Ok(inner) => inner.map_err(StoreError::from),
            Err(_) => Err(StoreError::CommandTimeout(self.command_timeout)),
        };
        if let Err(e) = &outcome {
            if e.is_connection_fault() {
                warn!(error = %e, "Discarding broken Redis connection");
                self.broken = true;
            }
        }
        outcome
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.broken {
            self.pool.release(self.conn.clone());
        }
    }
}

#[async_trait]
impl KvConnection for PooledConnection {
    async fn lpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            ::redis::cmd("LPOP")
                .arg(key)
                .query_async::<_, Option<String>>(&mut self.conn),
        )
        .await;
        self.finish(result)
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let timeout = self.command_timeout;
        let result =
            tokio::time::timeout(timeout, self.conn.rpush::<_, _, usize>(key, values)).await;
        self.finish(result)
    }

    async fn lrange(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.conn.lrange::<_, Vec<String>>(key, start, stop),
        )
        .await;
        self.finish(result)
    }

    async fn lrem(&mut self, key: &str, count: isize, value: &str) -> Result<usize, StoreError> {
        let timeout = self.command_timeout;
        let result =
            tokio::time::timeout(timeout, self.conn.lrem::<_, _, usize>(key, count, value)).await;
        self.finish(result)
    }

    async fn llen(&mut self, key: &str) -> Result<usize, StoreError> {
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(timeout, self.conn.llen::<_, usize>(key)).await;
        self.finish(result)
    }

    async fn hset_multiple(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.conn.hset_multiple::<_, _, _, ()>(key, fields),
        )
        .await;
        self.finish(result)
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let timeout = self.command_timeout;
        let result =
            tokio::time::timeout(timeout, self.conn.hget::<_, _, Option<String>>(key, field)).await;
        self.finish(result)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.conn.hgetall::<_, HashMap<String, String>>(key),
        )
        .await;
        self.finish(result)
    }

    async fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.conn.hincr::<_, _, _, i64>(key, field, delta),
        )
        .await;
        self.finish(result)
    }

    async fn del(&mut self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let timeout = self.command_timeout;
        let result = tokio::time::timeout(timeout, self.conn.del::<_, usize>(keys)).await;
        self.finish(result)
    }
}

/// [`KvStore`] backed by Redis.
#[derive(Debug, Clone)]
pub struct RedisStore {
    pool: RedisPool,
}

impl RedisStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// Builds the pool from configuration and opens `min_idle` connections.
    pub async fn connect(config: &CacheQueueConfig) -> Result<Self, StoreError> {
        let pool = RedisPool::from_config(config)?;
        let opened = pool.warm_up().await?;
        debug!(
            opened = opened,
            max_total = pool.max_total(),
            "Redis pool ready"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for RedisStore {
    type Connection = PooledConnection;

    async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        self.pool.acquire().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_pool(max_total: usize) -> RedisPool {
        let config = PoolConfig {
            max_total,
            max_idle: max_total,
            connect_timeout_ms: 500,
            max_wait_ms: 200,
            ..Default::default()
        };
        RedisPool::new("redis://127.0.0.1:1/", config).expect("url should parse")
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = RedisPool::new("not a url", PoolConfig::default());
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }

    #[test]
    fn test_pool_from_config() {
        let config = CacheQueueConfig::default().with_pool(PoolConfig {
            max_total: 3,
            max_idle: 2,
            ..Default::default()
        });
        let pool = RedisPool::from_config(&config).expect("pool");

        assert_eq!(pool.max_total(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_new_caps_idle_limits() {
        let config = PoolConfig {
            max_total: 4,
            max_idle: 2,
            min_idle: 6,
            ..Default::default()
        };
        let pool = RedisPool::new("redis://127.0.0.1:1/", config).expect("url should parse");

        assert_eq!(pool.config().max_idle, 2);
        assert_eq!(pool.config().min_idle, 2);
    }

    #[tokio::test]
    async fn test_failed_acquire_releases_permit() {
        let pool = unreachable_pool(1);

        let err = pool.acquire().await.err().expect("connect should fail");
        assert!(matches!(err, StoreError::Connect(_)));
        assert_eq!(pool.available(), 1);

        // The slot is free again, so the second attempt fails on connect,
        // not on the pool wait.
        let err = pool.acquire().await.err().expect("connect should fail");
        assert!(matches!(err, StoreError::Connect(_)));
    }

    #[tokio::test]
    async fn test_warm_up_noop_without_min_idle() {
        let pool = unreachable_pool(2);
        assert_eq!(pool.warm_up().await.expect("nothing to open"), 0);
    }
}
