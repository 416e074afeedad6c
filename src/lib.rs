//! cache-queue: a Redis-backed two-level work queue.
//!
//! Producers submit ordered item lists as *batches*; each batch is split into
//! fixed-size *blocks*. Consumers pop batches and then blocks from per-stream
//! FIFOs, so every batch and block is handed to at most one consumer.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cache_queue::{CacheQueueConfig, JsonCodec, LoggingHandler, Processor, QueueStore, RedisStore};
//!
//! let config = CacheQueueConfig::from_env()?;
//! let store = RedisStore::connect(&config).await?;
//! let queue = Arc::new(QueueStore::new(store, JsonCodec::<String>::new()));
//!
//! let processor = Processor::new(queue, "orders", LoggingHandler).with_block_size(50);
//! processor.submit(&tasks).await?;
//! processor.process().await?;
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod processor;
pub mod queue;
pub mod store;

pub use codec::{Codec, JsonCodec};
pub use config::{CacheQueueConfig, ConfigError};
pub use error::{QueueError, SerializationError, StoreError};
pub use model::{Batch, Block};
pub use processor::{
    BlockHandler, ConsumerPool, ConsumerPoolConfig, LoggingHandler, Processor, ProcessorError,
};
pub use queue::{ConsumeCounter, QueueStats, QueueStore};
pub use store::{KvConnection, KvStore, MemoryStore, RedisStore};
