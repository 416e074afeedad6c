//! Consumers that drain a business stream through a [`BlockHandler`].
//!
//! - **Processor**: producer/consumer bound to one `biz_id`. `process()` pops
//!   batches until none are pending and, for each, pops blocks until none are
//!   pending, calling the handler and marking each block consumed. A batch
//!   that reaches completion is removed.
//! - **ConsumerPool**: N processors polling the same stream, with graceful
//!   shutdown.
//!
//! ```text
//!   Processor::submit ──► QueueStore::add_batch
//!
//!   Processor::process
//!     └─ next_batch ─► next_block ─► handler ─► mark_block_consumed
//!                          ▲                          │
//!                          └──────────────────────────┘
//!                      (until empty, then remove_batch if completed)
//! ```
//!
//! Work popped by a consumer is not re-enqueued: a handler failure or a
//! crash mid-batch leaves the rest of that batch unreachable through the
//! FIFOs.

pub mod driver;
pub mod worker_pool;

pub use driver::{
    generate_batch_id, BatchOutcome, BlockHandler, LoggingHandler, ProcessSummary, Processor,
    ProcessorError, DEFAULT_BLOCK_SIZE,
};
pub use worker_pool::{ConsumerPool, ConsumerPoolConfig, PoolError, PoolStats};
