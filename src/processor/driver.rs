//! Single-stream processor: submits batches and drains them block by block.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::Codec;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::model::{Batch, Block};
use crate::queue::QueueStore;
use crate::store::KvStore;

/// Block size used when none is configured for a business stream.
pub const DEFAULT_BLOCK_SIZE: usize = 100;

/// Errors surfaced by [`Processor`].
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The application handler rejected a block. The block has already left
    /// its FIFO and is not marked consumed.
    #[error("Handler failed on block {block_index} of batch {batch_id}: {source}")]
    Handler {
        batch_id: String,
        block_index: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Application logic invoked once per popped block.
#[async_trait]
pub trait BlockHandler<E: Send + Sync>: Send + Sync + 'static {
    async fn handle_block(&self, batch: &Batch, block: &Block<E>) -> anyhow::Result<()>;
}

/// Handler that logs every item of a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl<E> BlockHandler<E> for LoggingHandler
where
    E: Debug + Send + Sync + 'static,
{
    async fn handle_block(&self, batch: &Batch, block: &Block<E>) -> anyhow::Result<()> {
        for item in block.items() {
            info!(
                biz_id = %batch.biz_id,
                batch_id = %batch.batch_id,
                block_index = block.block_index,
                item = ?item,
                "Processing task"
            );
        }
        Ok(())
    }
}

/// Result of draining one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_id: String,
    /// Blocks handed to the handler and marked consumed.
    pub blocks_processed: usize,
    /// Blocks popped that were already flagged consumed.
    pub blocks_skipped: usize,
    /// Whether the batch reached completion and was removed.
    pub completed: bool,
}

/// Totals for one [`Processor::process`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub batches_processed: usize,
    pub batches_completed: usize,
    pub blocks_processed: usize,
    pub blocks_skipped: usize,
}

impl ProcessSummary {
    fn record(&mut self, outcome: &BatchOutcome) {
        self.batches_processed += 1;
        self.blocks_processed += outcome.blocks_processed;
        self.blocks_skipped += outcome.blocks_skipped;
        if outcome.completed {
            self.batches_completed += 1;
        }
    }
}

/// Generates a batch id of the form `batch_<epoch millis>_<8 hex chars>`.
pub fn generate_batch_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Producer and consumer bound to one business stream.
///
/// Cloning shares the underlying queue and handler, so clones can run as
/// concurrent consumers of the same stream.
pub struct Processor<S, C, H> {
    queue: Arc<QueueStore<S, C>>,
    handler: Arc<H>,
    biz_id: String,
    block_size: usize,
    metrics: MetricsCollector,
}

impl<S, C, H> Clone for Processor<S, C, H> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            handler: Arc::clone(&self.handler),
            biz_id: self.biz_id.clone(),
            block_size: self.block_size,
            metrics: self.metrics,
        }
    }
}

impl<S, C, H> Processor<S, C, H>
where
    S: KvStore,
    C: Codec,
    H: BlockHandler<C::Item>,
{
    pub fn new(queue: Arc<QueueStore<S, C>>, biz_id: impl Into<String>, handler: H) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            biz_id: biz_id.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the block size used by [`Processor::submit`].
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn biz_id(&self) -> &str {
        &self.biz_id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn queue(&self) -> &Arc<QueueStore<S, C>> {
        &self.queue
    }

    /// Submits `items` as a new batch with a generated id.
    pub async fn init(&self, items: &[C::Item], block_size: usize) -> Result<Batch, ProcessorError> {
        let batch_id = generate_batch_id();
        let batch = self
            .queue
            .add_batch(&self.biz_id, &batch_id, block_size, items)
            .await?;

        info!(
            biz_id = %self.biz_id,
            batch_id = %batch.batch_id,
            items = items.len(),
            block_size = block_size,
            "Batch initialized"
        );
        Ok(batch)
    }

    /// Submits `items` using the processor's default block size.
    pub async fn submit(&self, items: &[C::Item]) -> Result<Batch, ProcessorError> {
        self.init(items, self.block_size).await
    }

    /// Drains every pending batch of the stream.
    ///
    /// Stops at the first error, leaving already-popped work behind.
    pub async fn process(&self) -> Result<ProcessSummary, ProcessorError> {
        let mut summary = ProcessSummary::default();

        while let Some(outcome) = self.process_next().await? {
            summary.record(&outcome);
        }

        info!(
            biz_id = %self.biz_id,
            batches = summary.batches_processed,
            blocks = summary.blocks_processed,
            "No more batches to process"
        );
        Ok(summary)
    }

    /// Pops and drains one batch. Returns `Ok(None)` when nothing is pending.
    pub async fn process_next(&self) -> Result<Option<BatchOutcome>, ProcessorError> {
        let Some(batch) = self.queue.next_batch(&self.biz_id).await? else {
            return Ok(None);
        };

        info!(biz_id = %self.biz_id, batch_id = %batch.batch_id, "Processing batch");
        self.process_batch(batch).await.map(Some)
    }

    /// Drains the blocks of a popped batch and removes it once completed.
    pub async fn process_batch(&self, mut batch: Batch) -> Result<BatchOutcome, ProcessorError> {
        let mut outcome = BatchOutcome {
            batch_id: batch.batch_id.clone(),
            blocks_processed: 0,
            blocks_skipped: 0,
            completed: false,
        };

        while let Some(block) = self
            .queue
            .next_block(&self.biz_id, &batch.batch_id)
            .await?
        {
            if block.consumed {
                debug!(
                    batch_id = %batch.batch_id,
                    block_index = block.block_index,
                    "Block already consumed, skipping"
                );
                outcome.blocks_skipped += 1;
                continue;
            }

            if let Err(source) = self.handler.handle_block(&batch, &block).await {
                self.metrics.record_handler_failure(&self.biz_id);
                warn!(
                    batch_id = %batch.batch_id,
                    block_index = block.block_index,
                    error = %source,
                    "Block handler failed"
                );
                return Err(ProcessorError::Handler {
                    batch_id: batch.batch_id.clone(),
                    block_index: block.block_index,
                    source,
                });
            }

            let consumed = self
                .queue
                .mark_block_consumed(&self.biz_id, &batch.batch_id, block.block_index)
                .await?;
            batch.consumed_block_count = consumed;
            outcome.blocks_processed += 1;

            debug!(
                batch_id = %batch.batch_id,
                block_index = block.block_index,
                consumed_block_count = consumed,
                "Block consumed"
            );
        }

        if batch.is_completed() {
            self.queue.remove_batch(&self.biz_id, &batch.batch_id).await?;
            self.metrics.record_batch_completed(&self.biz_id);
            outcome.completed = true;
            info!(
                biz_id = %self.biz_id,
                batch_id = %batch.batch_id,
                "Batch completed and removed"
            );
        } else {
            warn!(
                biz_id = %self.biz_id,
                batch_id = %batch.batch_id,
                consumed = batch.consumed_block_count,
                block_count = batch.block_count,
                "Batch drained without reaching completion"
            );
        }

        Ok(outcome)
    }
}
