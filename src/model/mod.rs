//! Entity model for the two-level work distribution queue.
//!
//! - **Batch**: a named unit of work for one business stream
//! - **Block**: a fixed-size, ordered chunk of a batch's items

pub mod batch;
pub mod block;

pub use batch::{block_count_for, Batch};
pub use block::Block;
