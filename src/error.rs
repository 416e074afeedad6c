//! Error types for cache queue operations.
//!
//! Errors are layered the way they surface:
//! - `StoreError` for primitive key-value commands and connection pooling
//! - `SerializationError` for item encode/decode failures
//! - `QueueError` wraps both and is the only error returned by `QueueStore`

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the key-value store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command or connection failure.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled connection became available in time.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// Opening a new connection failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// A single command exceeded the configured timeout.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// A key holds a value of a different type than the command expects.
    #[error("Key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    /// The store rejected a command's arguments.
    #[error("Command rejected: {0}")]
    Command(String),
}

impl StoreError {
    /// Returns whether the underlying connection should be considered broken.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            StoreError::Redis(e) => e.is_io_error() || e.is_connection_dropped(),
            StoreError::CommandTimeout(_) => true,
            _ => false,
        }
    }
}

/// Errors raised while encoding or decoding queue items.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Failure reported by an application-supplied codec.
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors returned by every public `QueueStore` operation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{op} failed: {source}")]
    Serialization {
        op: &'static str,
        #[source]
        source: SerializationError,
    },

    #[error("Malformed field '{field}' in '{key}': {value:?}")]
    CorruptMetadata {
        key: String,
        field: &'static str,
        value: String,
    },

    #[error("Invalid block size {0}: must be greater than 0")]
    InvalidBlockSize(usize),

    #[error("Batch '{batch_id}' already exists for biz '{biz_id}'")]
    BatchExists { biz_id: String, batch_id: String },

    #[error("Batch '{batch_id}' not found for biz '{biz_id}'")]
    BatchNotFound { biz_id: String, batch_id: String },
}

impl QueueError {
    pub(crate) fn store(op: &'static str) -> impl FnOnce(StoreError) -> QueueError {
        move |source| QueueError::Store { op, source }
    }

    pub(crate) fn serialization(op: &'static str) -> impl FnOnce(SerializationError) -> QueueError {
        move |source| QueueError::Serialization { op, source }
    }
}
