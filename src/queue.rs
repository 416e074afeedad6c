//! Store-backed batch/block queue.
//!
//! A producer submits a batch of items for a business stream with
//! [`QueueStore::add_batch`]. The items are split into fixed-size blocks and
//! every entity gets its own keys (see [`crate::store::keys`]). Two FIFO lists
//! hand work out to consumers:
//!
//! - `cache_queue:{biz}:batches`: pending batch ids
//! - `cache_queue:{biz}:batch:{batch}:blocks`: pending block indices
//!
//! Popping from a FIFO is a single store command, so each batch id and block
//! index goes to at most one consumer no matter how many poll concurrently.
//!
//! # Multi-step operations
//!
//! `add_batch` and `mark_block_consumed` are sequences of commands, not
//! transactions. `add_batch` deletes whatever it wrote if a later step fails
//! and only enqueues the batch id once every block is in place.
//! `mark_block_consumed` increments the batch counter according to
//! [`ConsumeCounter`]: the default read-modify-write can lose an increment
//! when two consumers finish blocks of the same batch at the same moment;
//! `ConsumeCounter::Atomic` uses `HINCRBY` instead.
//!
//! Every operation holds exactly one pooled connection, released on return.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{decode_from_string, encode_to_string, Codec};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::model::{block_count_for, Batch, Block};
use crate::store::keys;
use crate::store::{KvConnection, KvStore};

/// How `mark_block_consumed` advances a batch's consumed-block counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeCounter {
    /// `HGET` then `HSET`. Concurrent consumers of one batch may lose updates.
    #[default]
    ReadModifyWrite,
    /// Single `HINCRBY`.
    Atomic,
}

/// Queue depth for one business stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub biz_id: String,
    /// Batch ids waiting in the batch FIFO.
    pub pending_batches: usize,
    /// Block indices waiting across all pending batches.
    pub pending_blocks: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.pending_batches == 0
    }
}

/// Two-level batch/block queue over a [`KvStore`].
pub struct QueueStore<S, C> {
    store: S,
    codec: C,
    counter: ConsumeCounter,
    metrics: MetricsCollector,
}

impl<S, C> QueueStore<S, C>
where
    S: KvStore,
    C: Codec,
{
    pub fn new(store: S, codec: C) -> Self {
        Self {
            store,
            codec,
            counter: ConsumeCounter::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the consumed-block counter strategy.
    pub fn with_counter_mode(mut self, counter: ConsumeCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter_mode(&self) -> ConsumeCounter {
        self.counter
    }

    async fn connection(&self, op: &'static str) -> Result<S::Connection, QueueError> {
        self.store.acquire().await.map_err(QueueError::store(op))
    }

    /// Submits `items` as a new batch split into blocks of `block_size`.
    ///
    /// Writes the batch metadata, then every block, then appends `batch_id`
    /// to the batch FIFO. If any step fails, the keys already written for
    /// this batch are deleted before the error is returned.
    ///
    /// # Errors
    ///
    /// - `QueueError::InvalidBlockSize` if `block_size` is 0
    /// - `QueueError::BatchExists` if `batch_id` already has metadata; nothing
    ///   is written in that case
    /// - `QueueError::Serialization` if an item cannot be encoded
    /// - `QueueError::Store` if a store command fails
    pub async fn add_batch(
        &self,
        biz_id: &str,
        batch_id: &str,
        block_size: usize,
        items: &[C::Item],
    ) -> Result<Batch, QueueError> {
        const OP: &str = "add_batch";

        if block_size == 0 {
            return Err(QueueError::InvalidBlockSize(block_size));
        }

        let batch = Batch::new(biz_id, batch_id, block_size, block_count_for(items.len(), block_size));
        let mut conn = self.connection(OP).await?;

        let existing = conn
            .hgetall(&keys::batch_info_key(biz_id, batch_id))
            .await
            .map_err(QueueError::store(OP))?;
        if !existing.is_empty() {
            return Err(QueueError::BatchExists {
                biz_id: biz_id.to_string(),
                batch_id: batch_id.to_string(),
            });
        }

        if let Err(e) = self.write_batch(&mut conn, &batch, items).await {
            warn!(
                biz_id = %biz_id,
                batch_id = %batch_id,
                error = %e,
                "Failed to add batch, removing partial writes"
            );
            if let Err(cleanup_err) = purge_batch(&mut conn, biz_id, batch_id, batch.block_count).await {
                warn!(
                    biz_id = %biz_id,
                    batch_id = %batch_id,
                    error = %cleanup_err,
                    "Failed to remove partial batch"
                );
            }
            return Err(e);
        }

        self.metrics.record_batch_added(biz_id, batch.block_count);
        info!(
            biz_id = %biz_id,
            batch_id = %batch_id,
            items = items.len(),
            block_size = block_size,
            block_count = batch.block_count,
            "Batch added"
        );

        Ok(batch)
    }

    async fn write_batch(
        &self,
        conn: &mut S::Connection,
        batch: &Batch,
        items: &[C::Item],
    ) -> Result<(), QueueError> {
        const OP: &str = "add_batch";

        let info_key = keys::batch_info_key(&batch.biz_id, &batch.batch_id);
        conn.hset_multiple(
            &info_key,
            &[
                (keys::BATCH_BIZ_ID, batch.biz_id.clone()),
                (keys::BATCH_BATCH_ID, batch.batch_id.clone()),
                (keys::BATCH_BLOCK_SIZE, batch.block_size.to_string()),
                (keys::BATCH_BLOCK_COUNT, batch.block_count.to_string()),
                (keys::BATCH_CONSUMED_BLOCK_COUNT, "0".to_string()),
                (
                    keys::BATCH_START_TIME,
                    batch.start_time.timestamp_millis().to_string(),
                ),
            ],
        )
        .await
        .map_err(QueueError::store(OP))?;

        for (block_index, chunk) in items.chunks(batch.block_size).enumerate() {
            self.write_block(conn, &batch.biz_id, &batch.batch_id, block_index, chunk, OP)
                .await?;
        }

        conn.rpush(&keys::batches_key(&batch.biz_id), &[batch.batch_id.clone()])
            .await
            .map_err(QueueError::store(OP))?;

        Ok(())
    }

    /// Writes one block and appends its index to the batch's block FIFO.
    ///
    /// Items are encoded before anything is written, so an encoding failure
    /// leaves no trace of the block.
    pub async fn add_block(
        &self,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
        items: &[C::Item],
    ) -> Result<(), QueueError> {
        const OP: &str = "add_block";
        let mut conn = self.connection(OP).await?;
        self.write_block(&mut conn, biz_id, batch_id, block_index, items, OP)
            .await
    }

    async fn write_block(
        &self,
        conn: &mut S::Connection,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
        items: &[C::Item],
        op: &'static str,
    ) -> Result<(), QueueError> {
        let encoded = items
            .iter()
            .map(|item| encode_to_string(&self.codec, item))
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::serialization(op))?;

        conn.hset_multiple(
            &keys::block_info_key(biz_id, batch_id, block_index),
            &[
                (keys::BLOCK_INDEX, block_index.to_string()),
                (keys::BLOCK_CONSUMED, "false".to_string()),
                (
                    keys::BLOCK_CREATE_TIME,
                    Utc::now().timestamp_millis().to_string(),
                ),
            ],
        )
        .await
        .map_err(QueueError::store(op))?;

        conn.rpush(&keys::block_data_key(biz_id, batch_id, block_index), &encoded)
            .await
            .map_err(QueueError::store(op))?;

        conn.rpush(&keys::blocks_key(biz_id, batch_id), &[block_index.to_string()])
            .await
            .map_err(QueueError::store(op))?;

        debug!(
            biz_id = %biz_id,
            batch_id = %batch_id,
            block_index = block_index,
            items = items.len(),
            "Block written"
        );

        Ok(())
    }

    /// Pops the next pending batch for `biz_id`.
    ///
    /// Returns `Ok(None)` once the batch FIFO is empty. Ids whose metadata
    /// has been removed in the meantime are skipped.
    pub async fn next_batch(&self, biz_id: &str) -> Result<Option<Batch>, QueueError> {
        const OP: &str = "next_batch";
        let mut conn = self.connection(OP).await?;
        let fifo = keys::batches_key(biz_id);

        loop {
            let Some(batch_id) = conn.lpop(&fifo).await.map_err(QueueError::store(OP))? else {
                return Ok(None);
            };

            match read_batch(&mut conn, biz_id, &batch_id, OP).await? {
                Some(batch) => {
                    debug!(biz_id = %biz_id, batch_id = %batch_id, "Popped batch");
                    return Ok(Some(batch));
                }
                None => warn!(
                    biz_id = %biz_id,
                    batch_id = %batch_id,
                    "Skipping batch id without metadata"
                ),
            }
        }
    }

    /// Pops the next pending block of a batch, with its decoded items.
    ///
    /// Returns `Ok(None)` once the block FIFO is empty. Indices whose
    /// metadata has been removed in the meantime are skipped.
    pub async fn next_block(
        &self,
        biz_id: &str,
        batch_id: &str,
    ) -> Result<Option<Block<C::Item>>, QueueError> {
        const OP: &str = "next_block";
        let mut conn = self.connection(OP).await?;
        let fifo = keys::blocks_key(biz_id, batch_id);

        loop {
            let Some(raw) = conn.lpop(&fifo).await.map_err(QueueError::store(OP))? else {
                return Ok(None);
            };
            let block_index = parse_value(&fifo, keys::BLOCK_INDEX, &raw)?;

            match self
                .read_block(&mut conn, biz_id, batch_id, block_index, OP)
                .await?
            {
                Some(block) => {
                    debug!(
                        biz_id = %biz_id,
                        batch_id = %batch_id,
                        block_index = block_index,
                        "Popped block"
                    );
                    return Ok(Some(block));
                }
                None => warn!(
                    biz_id = %biz_id,
                    batch_id = %batch_id,
                    block_index = block_index,
                    "Skipping block index without metadata"
                ),
            }
        }
    }

    /// Flags a block as consumed and advances its batch's counter.
    ///
    /// Returns the counter value written. With
    /// [`ConsumeCounter::ReadModifyWrite`] two concurrent calls for the same
    /// batch can both read the same value, and one increment is lost.
    ///
    /// Fails with `QueueError::BatchNotFound` without writing anything when
    /// the batch metadata is gone. A `remove_batch` racing between that check
    /// and the writes can still leave the recreated hashes behind.
    pub async fn mark_block_consumed(
        &self,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
    ) -> Result<usize, QueueError> {
        const OP: &str = "mark_block_consumed";
        let mut conn = self.connection(OP).await?;

        let info_key = keys::batch_info_key(biz_id, batch_id);
        if conn
            .hget(&info_key, keys::BATCH_BLOCK_COUNT)
            .await
            .map_err(QueueError::store(OP))?
            .is_none()
        {
            return Err(QueueError::BatchNotFound {
                biz_id: biz_id.to_string(),
                batch_id: batch_id.to_string(),
            });
        }

        conn.hset_multiple(
            &keys::block_info_key(biz_id, batch_id, block_index),
            &[(keys::BLOCK_CONSUMED, "true".to_string())],
        )
        .await
        .map_err(QueueError::store(OP))?;

        let consumed = match self.counter {
            ConsumeCounter::ReadModifyWrite => {
                let current = match conn
                    .hget(&info_key, keys::BATCH_CONSUMED_BLOCK_COUNT)
                    .await
                    .map_err(QueueError::store(OP))?
                {
                    Some(raw) => parse_value(&info_key, keys::BATCH_CONSUMED_BLOCK_COUNT, &raw)?,
                    None => 0,
                };
                let next = current + 1;
                conn.hset_multiple(
                    &info_key,
                    &[(keys::BATCH_CONSUMED_BLOCK_COUNT, next.to_string())],
                )
                .await
                .map_err(QueueError::store(OP))?;
                next
            }
            ConsumeCounter::Atomic => {
                let next = conn
                    .hincr(&info_key, keys::BATCH_CONSUMED_BLOCK_COUNT, 1)
                    .await
                    .map_err(QueueError::store(OP))?;
                usize::try_from(next).map_err(|_| QueueError::CorruptMetadata {
                    key: info_key.clone(),
                    field: keys::BATCH_CONSUMED_BLOCK_COUNT,
                    value: next.to_string(),
                })?
            }
        };

        self.metrics.record_block_consumed(biz_id);
        debug!(
            biz_id = %biz_id,
            batch_id = %batch_id,
            block_index = block_index,
            consumed_block_count = consumed,
            "Block marked consumed"
        );

        Ok(consumed)
    }

    /// Reads batch metadata. Returns `Ok(None)` if the batch does not exist.
    pub async fn get_batch(&self, biz_id: &str, batch_id: &str) -> Result<Option<Batch>, QueueError> {
        const OP: &str = "get_batch";
        let mut conn = self.connection(OP).await?;
        read_batch(&mut conn, biz_id, batch_id, OP).await
    }

    /// Reads a block and decodes its items. Returns `Ok(None)` if the block
    /// does not exist.
    pub async fn get_block(
        &self,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
    ) -> Result<Option<Block<C::Item>>, QueueError> {
        const OP: &str = "get_block";
        let mut conn = self.connection(OP).await?;
        self.read_block(&mut conn, biz_id, batch_id, block_index, OP)
            .await
    }

    async fn read_block(
        &self,
        conn: &mut S::Connection,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
        op: &'static str,
    ) -> Result<Option<Block<C::Item>>, QueueError> {
        let info_key = keys::block_info_key(biz_id, batch_id, block_index);
        let info = conn.hgetall(&info_key).await.map_err(QueueError::store(op))?;
        if info.is_empty() {
            return Ok(None);
        }

        let consumed = info
            .get(keys::BLOCK_CONSUMED)
            .is_some_and(|raw| raw.eq_ignore_ascii_case("true"));
        let create_time = parse_timestamp(&info_key, keys::BLOCK_CREATE_TIME, &info)?;

        let encoded = conn
            .lrange(&keys::block_data_key(biz_id, batch_id, block_index), 0, -1)
            .await
            .map_err(QueueError::store(op))?;
        let items = encoded
            .iter()
            .map(|text| decode_from_string(&self.codec, text))
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::serialization(op))?;

        Ok(Some(
            Block::with_items(block_index, items)
                .with_create_time(create_time)
                .with_consumed(consumed),
        ))
    }

    /// Deletes a batch with all of its blocks and drops it from the batch FIFO.
    ///
    /// Blocks are found through the `blockCount` read before the metadata is
    /// deleted. Removing a batch that does not exist is a no-op.
    pub async fn remove_batch(&self, biz_id: &str, batch_id: &str) -> Result<(), QueueError> {
        const OP: &str = "remove_batch";
        let mut conn = self.connection(OP).await?;

        let block_count = read_batch(&mut conn, biz_id, batch_id, OP)
            .await?
            .map_or(0, |batch| batch.block_count);

        purge_batch(&mut conn, biz_id, batch_id, block_count)
            .await
            .map_err(QueueError::store(OP))?;
        conn.lrem(&keys::batches_key(biz_id), 1, batch_id)
            .await
            .map_err(QueueError::store(OP))?;

        info!(
            biz_id = %biz_id,
            batch_id = %batch_id,
            block_count = block_count,
            "Batch removed"
        );
        Ok(())
    }

    /// Deletes a block's keys and drops its index from the block FIFO.
    ///
    /// Idempotent: removing a block that does not exist is a no-op.
    pub async fn remove_block(
        &self,
        biz_id: &str,
        batch_id: &str,
        block_index: usize,
    ) -> Result<(), QueueError> {
        const OP: &str = "remove_block";
        let mut conn = self.connection(OP).await?;
        purge_block(&mut conn, biz_id, batch_id, block_index)
            .await
            .map_err(QueueError::store(OP))
    }

    /// Number of batch ids waiting for `biz_id`.
    pub async fn pending_batches(&self, biz_id: &str) -> Result<usize, QueueError> {
        const OP: &str = "pending_batches";
        let mut conn = self.connection(OP).await?;
        conn.llen(&keys::batches_key(biz_id))
            .await
            .map_err(QueueError::store(OP))
    }

    /// Number of block indices waiting for a batch.
    pub async fn pending_blocks(&self, biz_id: &str, batch_id: &str) -> Result<usize, QueueError> {
        const OP: &str = "pending_blocks";
        let mut conn = self.connection(OP).await?;
        conn.llen(&keys::blocks_key(biz_id, batch_id))
            .await
            .map_err(QueueError::store(OP))
    }

    /// Ids of batches waiting for `biz_id`, in hand-out order.
    pub async fn pending_batch_ids(&self, biz_id: &str) -> Result<Vec<String>, QueueError> {
        const OP: &str = "pending_batch_ids";
        let mut conn = self.connection(OP).await?;
        conn.lrange(&keys::batches_key(biz_id), 0, -1)
            .await
            .map_err(QueueError::store(OP))
    }

    /// Returns queue depth for `biz_id` and updates the pending gauge.
    pub async fn stats(&self, biz_id: &str) -> Result<QueueStats, QueueError> {
        const OP: &str = "stats";
        let mut conn = self.connection(OP).await?;

        let batch_ids = conn
            .lrange(&keys::batches_key(biz_id), 0, -1)
            .await
            .map_err(QueueError::store(OP))?;
        let mut pending_blocks = 0;
        for batch_id in &batch_ids {
            pending_blocks += conn
                .llen(&keys::blocks_key(biz_id, batch_id))
                .await
                .map_err(QueueError::store(OP))?;
        }

        self.metrics.set_pending_batches(biz_id, batch_ids.len());
        Ok(QueueStats {
            biz_id: biz_id.to_string(),
            pending_batches: batch_ids.len(),
            pending_blocks,
        })
    }
}

async fn read_batch<K: KvConnection>(
    conn: &mut K,
    biz_id: &str,
    batch_id: &str,
    op: &'static str,
) -> Result<Option<Batch>, QueueError> {
    let info_key = keys::batch_info_key(biz_id, batch_id);
    let info = conn.hgetall(&info_key).await.map_err(QueueError::store(op))?;

    let (Some(block_size), Some(block_count)) = (
        info.get(keys::BATCH_BLOCK_SIZE),
        info.get(keys::BATCH_BLOCK_COUNT),
    ) else {
        return Ok(None);
    };

    let block_size = parse_value(&info_key, keys::BATCH_BLOCK_SIZE, block_size)?;
    let block_count = parse_value(&info_key, keys::BATCH_BLOCK_COUNT, block_count)?;
    let consumed = match info.get(keys::BATCH_CONSUMED_BLOCK_COUNT) {
        Some(raw) => parse_value(&info_key, keys::BATCH_CONSUMED_BLOCK_COUNT, raw)?,
        None => 0,
    };
    let start_time = parse_timestamp(&info_key, keys::BATCH_START_TIME, &info)?;

    Ok(Some(
        Batch::new(biz_id, batch_id, block_size, block_count)
            .with_start_time(start_time)
            .with_consumed_block_count(consumed),
    ))
}

/// Deletes everything stored for a batch except its entry in the batch FIFO.
async fn purge_batch<K: KvConnection>(
    conn: &mut K,
    biz_id: &str,
    batch_id: &str,
    block_count: usize,
) -> Result<(), crate::error::StoreError> {
    conn.del(&[keys::batch_info_key(biz_id, batch_id)]).await?;
    for block_index in 0..block_count {
        purge_block(conn, biz_id, batch_id, block_index).await?;
    }
    conn.del(&[keys::blocks_key(biz_id, batch_id)]).await?;
    Ok(())
}

async fn purge_block<K: KvConnection>(
    conn: &mut K,
    biz_id: &str,
    batch_id: &str,
    block_index: usize,
) -> Result<(), crate::error::StoreError> {
    conn.del(&[
        keys::block_info_key(biz_id, batch_id, block_index),
        keys::block_data_key(biz_id, batch_id, block_index),
    ])
    .await?;
    conn.lrem(&keys::blocks_key(biz_id, batch_id), 1, &block_index.to_string())
        .await?;
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, field: &'static str, raw: &str) -> Result<T, QueueError> {
    raw.trim().parse().map_err(|_| QueueError::CorruptMetadata {
        key: key.to_string(),
        field,
        value: raw.to_string(),
    })
}

/// Reads an epoch-millis field, falling back to now when it is absent.
fn parse_timestamp(
    key: &str,
    field: &'static str,
    info: &HashMap<String, String>,
) -> Result<DateTime<Utc>, QueueError> {
    let Some(raw) = info.get(field) else {
        return Ok(Utc::now());
    };
    let millis: i64 = parse_value(key, field, raw)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| QueueError::CorruptMetadata {
        key: key.to_string(),
        field,
        value: raw.clone(),
    })
}
