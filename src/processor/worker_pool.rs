//! Pool of concurrent consumers draining one business stream.
//!
//! Each consumer runs as an independent async task with its own clone of a
//! [`Processor`]. Consumers pop batches one at a time, so two of them never
//! hold the same batch; an idle consumer sleeps for `poll_interval` before
//! polling again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::driver::{BatchOutcome, BlockHandler, Processor, ProcessorError};
use crate::codec::Codec;
use crate::metrics::MetricsCollector;
use crate::store::KvStore;

/// Errors that can occur in the consumer pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the consumer pool.
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    /// Number of consumer tasks to spawn.
    pub num_consumers: usize,
    /// How long an idle consumer waits before polling again.
    pub poll_interval: Duration,
    /// How long a consumer backs off after a store failure.
    pub error_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            num_consumers: 4,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ConsumerPoolConfig {
    pub fn new(num_consumers: usize) -> Self {
        Self {
            num_consumers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the consumer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_consumers: usize,
    /// Consumers currently inside a batch.
    pub active_consumers: usize,
    pub blocks_processed: u64,
    /// Blocks whose handler failed.
    pub blocks_failed: u64,
    pub batches_completed: u64,
}

impl PoolStats {
    pub fn total_blocks(&self) -> u64 {
        self.blocks_processed + self.blocks_failed
    }

    /// Returns the block success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_blocks();
        if total == 0 {
            return 0.0;
        }
        (self.blocks_processed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    blocks_processed: AtomicU64,
    blocks_failed: AtomicU64,
    batches_completed: AtomicU64,
    active_consumers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            blocks_processed: AtomicU64::new(0),
            blocks_failed: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            active_consumers: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, outcome: &BatchOutcome) {
        self.blocks_processed
            .fetch_add(outcome.blocks_processed as u64, Ordering::SeqCst);
        if outcome.completed {
            self.batches_completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_failure(&self) {
        self.blocks_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_consumers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_consumers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_consumers: usize) -> PoolStats {
        PoolStats {
            num_consumers,
            active_consumers: self.active_consumers.load(Ordering::SeqCst) as usize,
            blocks_processed: self.blocks_processed.load(Ordering::SeqCst),
            blocks_failed: self.blocks_failed.load(Ordering::SeqCst),
            batches_completed: self.batches_completed.load(Ordering::SeqCst),
        }
    }
}

/// Runs several [`Processor`] clones against the same stream.
pub struct ConsumerPool<S, C, H> {
    config: ConsumerPoolConfig,
    processor: Processor<S, C, H>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl<S, C, H> ConsumerPool<S, C, H>
where
    S: KvStore,
    C: Codec,
    H: BlockHandler<C::Item>,
{
    pub fn new(config: ConsumerPoolConfig, processor: Processor<S, C, H>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            processor,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the consumers.
    ///
    /// # Errors
    ///
    /// - `PoolError::AlreadyRunning` if the pool is already running
    /// - `PoolError::InvalidConfig` if `num_consumers` is 0
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_consumers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_consumers must be greater than 0".to_string(),
            ));
        }

        for i in 0..self.config.num_consumers {
            let consumer = Consumer {
                id: format!("consumer-{}", i),
                processor: self.processor.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                error_backoff: self.config.error_backoff,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.handles.push(tokio::spawn(consumer.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            biz_id = %self.processor.biz_id(),
            num_consumers = self.config.num_consumers,
            "Consumer pool started"
        );

        Ok(())
    }

    /// Signals every consumer to stop and waits for them to finish the batch
    /// they are working on.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if consumers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(biz_id = %self.processor.biz_id(), "Initiating consumer pool shutdown");

        // Consumers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut self.handles);
        let wait_all = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Consumer task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, wait_all).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Consumer pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_consumers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_consumers(&self) -> usize {
        self.config.num_consumers
    }
}

struct Consumer<S, C, H> {
    id: String,
    processor: Processor<S, C, H>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    error_backoff: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl<S, C, H> Consumer<S, C, H>
where
    S: KvStore,
    C: Codec,
    H: BlockHandler<C::Item>,
{
    async fn run(mut self) {
        info!(worker_id = %self.id, "Consumer started");
        self.metrics.inc_active_consumers();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            self.stats.increment_active();
            let result = self.processor.process_next().await;
            self.stats.decrement_active();

            let pause = match result {
                Ok(Some(outcome)) => {
                    self.stats.record_outcome(&outcome);
                    debug!(
                        worker_id = %self.id,
                        batch_id = %outcome.batch_id,
                        blocks = outcome.blocks_processed,
                        completed = outcome.completed,
                        "Batch drained"
                    );
                    continue;
                }
                Ok(None) => self.poll_interval,
                Err(ProcessorError::Handler {
                    batch_id,
                    block_index,
                    source,
                }) => {
                    self.stats.record_failure();
                    warn!(
                        worker_id = %self.id,
                        batch_id = %batch_id,
                        block_index = block_index,
                        error = %source,
                        "Block handler failed, batch abandoned"
                    );
                    continue;
                }
                Err(ProcessorError::Queue(e)) => {
                    error!(worker_id = %self.id, error = %e, "Queue operation failed");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.metrics.dec_active_consumers();
        info!(worker_id = %self.id, "Consumer stopped");
    }
}
