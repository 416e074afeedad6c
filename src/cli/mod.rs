//! Command-line interface for cache-queue.
//!
//! Provides commands to submit batches, drain them, inspect queue state and
//! remove batches or blocks by hand.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
