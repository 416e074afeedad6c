//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_CONSUMERS, BATCHES_ADDED_TOTAL, BATCHES_COMPLETED_TOTAL, BLOCKS_ADDED_TOTAL,
    BLOCKS_CONSUMED_TOTAL, HANDLER_FAILURES_TOTAL, PENDING_BATCHES,
};

/// Records queue and consumer metrics.
///
/// Every method is a no-op until `init_metrics()` has run, so library users
/// who never export metrics pay nothing beyond a `OnceLock` check.
///
/// # Example
///
/// ```ignore
/// use cache_queue::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_batch_added("orders", 3);
/// collector.record_block_consumed("orders");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a submitted batch and the number of blocks it was split into.
    pub fn record_batch_added(&self, biz_id: &str, block_count: usize) {
        if let Some(batches) = BATCHES_ADDED_TOTAL.get() {
            batches.with_label_values(&[biz_id]).inc();
        }

        if let Some(blocks) = BLOCKS_ADDED_TOTAL.get() {
            blocks
                .with_label_values(&[biz_id])
                .inc_by(block_count as f64);
        }

        tracing::trace!(
            biz_id = biz_id,
            block_count = block_count,
            "Recorded batch added metric"
        );
    }

    pub fn record_block_consumed(&self, biz_id: &str) {
        if let Some(consumed) = BLOCKS_CONSUMED_TOTAL.get() {
            consumed.with_label_values(&[biz_id]).inc();
        }
    }

    pub fn record_handler_failure(&self, biz_id: &str) {
        if let Some(failures) = HANDLER_FAILURES_TOTAL.get() {
            failures.with_label_values(&[biz_id]).inc();
        }

        tracing::trace!(biz_id = biz_id, "Recorded handler failure metric");
    }

    pub fn record_batch_completed(&self, biz_id: &str) {
        if let Some(completed) = BATCHES_COMPLETED_TOTAL.get() {
            completed.with_label_values(&[biz_id]).inc();
        }
    }

    /// Update the pending batch gauge for a business stream.
    pub fn set_pending_batches(&self, biz_id: &str, pending: usize) {
        if let Some(gauge) = PENDING_BATCHES.get() {
            gauge.with_label_values(&[biz_id]).set(pending as f64);
        }

        tracing::trace!(
            biz_id = biz_id,
            pending = pending,
            "Updated pending batches metric"
        );
    }

    pub fn inc_active_consumers(&self) {
        if let Some(active) = ACTIVE_CONSUMERS.get() {
            active.inc();
        }
    }

    pub fn dec_active_consumers(&self) {
        if let Some(active) = ACTIVE_CONSUMERS.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert_eq!(std::mem::size_of_val(&collector), 0);
    }

    #[test]
    fn test_record_batch_added() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        let before = BLOCKS_ADDED_TOTAL
            .get()
            .map(|c| c.with_label_values(&["collector-test"]).get())
            .unwrap_or_default();
        collector.record_batch_added("collector-test", 3);
        let after = BLOCKS_ADDED_TOTAL
            .get()
            .map(|c| c.with_label_values(&["collector-test"]).get())
            .unwrap_or_default();

        assert_eq!(after - before, 3.0);
    }

    #[test]
    fn test_pending_batches_gauge() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.set_pending_batches("gauge-test", 7);
        let value = PENDING_BATCHES
            .get()
            .map(|g| g.with_label_values(&["gauge-test"]).get());
        assert_eq!(value, Some(7.0));
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_block_consumed("smoke");
        collector.record_handler_failure("smoke");
        collector.record_batch_completed("smoke");
        collector.inc_active_consumers();
        collector.dec_active_consumers();
    }
}
