//! Prometheus metrics for queue producers and consumers.
//!
//! # Example
//!
//! ```ignore
//! use cache_queue::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run producers and consumers ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_CONSUMERS, BATCHES_ADDED_TOTAL, BATCHES_COMPLETED_TOTAL, BLOCKS_ADDED_TOTAL,
    BLOCKS_CONSUMED_TOTAL, HANDLER_FAILURES_TOTAL, PENDING_BATCHES, REGISTRY,
};
