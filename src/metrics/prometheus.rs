//! Prometheus metrics registration and export.
//!
//! Every queue metric is labeled by `biz_id` except the consumer gauge,
//! which counts consumers across all streams of the process.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all cache queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Batches submitted, labeled by business id.
pub static BATCHES_ADDED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Blocks written per submitted batch, labeled by business id.
pub static BLOCKS_ADDED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Blocks marked consumed, labeled by business id.
pub static BLOCKS_CONSUMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Block handler failures, labeled by business id.
pub static HANDLER_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batches that reached completion, labeled by business id.
pub static BATCHES_COMPLETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batch ids waiting in the FIFO as of the last stats call.
pub static PENDING_BATCHES: OnceLock<GaugeVec> = OnceLock::new();

/// Consumers currently running.
pub static ACTIVE_CONSUMERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let batches_added = CounterVec::new(
        Opts::new("cache_queue_batches_added_total", "Total batches submitted"),
        &["biz_id"],
    )?;

    let blocks_added = CounterVec::new(
        Opts::new("cache_queue_blocks_added_total", "Total blocks written"),
        &["biz_id"],
    )?;

    let blocks_consumed = CounterVec::new(
        Opts::new(
            "cache_queue_blocks_consumed_total",
            "Total blocks marked consumed",
        ),
        &["biz_id"],
    )?;

    let handler_failures = CounterVec::new(
        Opts::new(
            "cache_queue_handler_failures_total",
            "Total block handler failures",
        ),
        &["biz_id"],
    )?;

    let batches_completed = CounterVec::new(
        Opts::new(
            "cache_queue_batches_completed_total",
            "Total batches fully consumed",
        ),
        &["biz_id"],
    )?;

    let pending_batches = GaugeVec::new(
        Opts::new("cache_queue_pending_batches", "Batch ids waiting to be consumed"),
        &["biz_id"],
    )?;

    let active_consumers = Gauge::new(
        "cache_queue_active_consumers",
        "Number of running queue consumers",
    )?;

    registry.register(Box::new(batches_added.clone()))?;
    registry.register(Box::new(blocks_added.clone()))?;
    registry.register(Box::new(blocks_consumed.clone()))?;
    registry.register(Box::new(handler_failures.clone()))?;
    registry.register(Box::new(batches_completed.clone()))?;
    registry.register(Box::new(pending_batches.clone()))?;
    registry.register(Box::new(active_consumers.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = BATCHES_ADDED_TOTAL.set(batches_added);
    let _ = BLOCKS_ADDED_TOTAL.set(blocks_added);
    let _ = BLOCKS_CONSUMED_TOTAL.set(blocks_consumed);
    let _ = HANDLER_FAILURES_TOTAL.set(handler_failures);
    let _ = BATCHES_COMPLETED_TOTAL.set(batches_completed);
    let _ = PENDING_BATCHES.set(pending_batches);
    let _ = ACTIVE_CONSUMERS.set(active_consumers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
