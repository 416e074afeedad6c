//! Key-value store primitives used by the queue.
//!
//! The queue only ever needs a small alphabet of commands: list push/pop/
//! range/remove/length, hash field get/set/increment, and key deletion.
//! [`KvStore`] hands out scoped connections; a connection is released when
//! it is dropped, so every exit path (success, store error, codec error)
//! returns it to the pool.
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: Redis over a bounded [`RedisPool`]
//! - [`MemoryStore`]: in-process store with the same single-command atomicity

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{PooledConnection, RedisPool, RedisStore};

/// Source of scoped store connections.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    type Connection: KvConnection;

    /// Acquires a connection, waiting while the pool is exhausted.
    async fn acquire(&self) -> Result<Self::Connection, StoreError>;
}

/// Primitive commands on one store connection.
///
/// Each call is a single store command and is atomic on its own; sequences
/// of calls are not.
#[async_trait]
pub trait KvConnection: Send {
    /// Removes and returns the head of a list.
    async fn lpop(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// Appends values to the tail of a list, returning the new length.
    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<usize, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive; negative
    /// indices count from the tail.
    async fn lrange(&mut self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Removes up to `count` occurrences of `value` (from the head when
    /// positive, from the tail when negative, all when zero).
    async fn lrem(&mut self, key: &str, count: isize, value: &str) -> Result<usize, StoreError>;

    async fn llen(&mut self, key: &str) -> Result<usize, StoreError>;

    async fn hset_multiple(&mut self, key: &str, fields: &[(&str, String)])
        -> Result<(), StoreError>;

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Returns every field of a hash; empty when the key does not exist.
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomically adds `delta` to an integer hash field, returning the new value.
    async fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Deletes keys, returning how many existed.
    async fn del(&mut self, keys: &[String]) -> Result<usize, StoreError>;
}
