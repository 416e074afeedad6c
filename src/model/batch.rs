//! Batch metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of blocks needed to hold `item_count` items, `ceil(item_count / block_size)`.
///
/// `block_size` must be non-zero.
pub fn block_count_for(item_count: usize, block_size: usize) -> usize {
    item_count.div_ceil(block_size)
}

/// A submitted unit of work for one business stream.
///
/// `block_count` is fixed when the batch is created. `consumed_block_count`
/// is advanced by consumers and the batch is completed once it reaches
/// `block_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Business stream this batch belongs to.
    pub biz_id: String,
    /// Identifier, unique within `biz_id`.
    pub batch_id: String,
    /// When the batch was created.
    pub start_time: DateTime<Utc>,
    /// Items per block.
    pub block_size: usize,
    /// Total number of blocks.
    pub block_count: usize,
    /// Blocks marked consumed so far.
    pub consumed_block_count: usize,
}

impl Batch {
    /// Creates a fresh, unconsumed batch.
    pub fn new(
        biz_id: impl Into<String>,
        batch_id: impl Into<String>,
        block_size: usize,
        block_count: usize,
    ) -> Self {
        Self {
            biz_id: biz_id.into(),
            batch_id: batch_id.into(),
            start_time: Utc::now(),
            block_size,
            block_count,
            consumed_block_count: 0,
        }
    }

    /// Sets the creation timestamp.
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Sets the consumed block counter.
    pub fn with_consumed_block_count(mut self, consumed: usize) -> Self {
        self.consumed_block_count = consumed;
        self
    }

    /// Returns whether every block has been consumed.
    pub fn is_completed(&self) -> bool {
        self.consumed_block_count >= self.block_count
    }

    /// Returns the number of blocks not yet consumed.
    pub fn remaining_blocks(&self) -> usize {
        self.block_count.saturating_sub(self.consumed_block_count)
    }

    /// Returns how long ago the batch was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }
}
