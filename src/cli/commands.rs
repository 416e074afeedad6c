//! Operator command definitions for cache-queue.
//!
//! Items are handled as raw JSON values, so the CLI can submit and inspect
//! batches for any business stream whose items are JSON-encoded.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::codec::JsonCodec;
use crate::config::CacheQueueConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::model::Batch;
use crate::processor::{ConsumerPool, ConsumerPoolConfig, LoggingHandler, Processor};
use crate::queue::QueueStore;
use crate::store::RedisStore;

type JsonQueue = QueueStore<RedisStore, JsonCodec<Value>>;

/// Operator tool for Redis-backed batch/block queues.
#[derive(Parser)]
#[command(name = "cache-queue")]
#[command(about = "Submit, drain and inspect Redis-backed batch/block queues")]
#[command(version)]
#[command(
    long_about = "cache-queue manages batch/block work queues stored in Redis.\n\nConnection settings come from --config or CACHE_QUEUE_* environment variables.\n\nExample usage:\n  cache-queue submit --biz orders --file tasks.jsonl --block-size 50\n  cache-queue drain --biz orders --consumers 4 --follow"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Falls back to CACHE_QUEUE_* variables.
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a JSONL file as a new batch (one item per line).
    Submit(SubmitArgs),

    /// Process pending batches with a handler that logs every item.
    Drain(DrainArgs),

    /// Show queue depth for a business stream.
    Stats(StatsArgs),

    /// Show a batch's metadata and, optionally, its blocks.
    ShowBatch(ShowBatchArgs),

    /// Delete a batch and all of its blocks.
    RemoveBatch(BatchRef),

    /// Delete a single block of a batch.
    RemoveBlock(RemoveBlockArgs),

    /// Print Prometheus metrics after refreshing queue gauges.
    Metrics(MetricsArgs),
}

/// Arguments for `cache-queue submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Business stream id.
    #[arg(short, long)]
    pub biz: String,

    /// JSONL file with one item per line.
    #[arg(short, long)]
    pub file: String,

    /// Items per block. Defaults to the configured size for the stream.
    #[arg(short = 's', long)]
    pub block_size: Option<usize>,

    /// Batch id to use instead of a generated one.
    #[arg(long)]
    pub batch_id: Option<String>,
}

/// Arguments for `cache-queue drain`.
#[derive(Parser, Debug)]
pub struct DrainArgs {
    #[arg(short, long)]
    pub biz: String,

    /// Number of concurrent consumers. Only valid with --follow; a one-shot
    /// drain runs a single consumer.
    #[arg(short = 'n', long, requires = "follow")]
    pub consumers: Option<usize>,

    /// Keep polling for new batches until interrupted.
    #[arg(long)]
    pub follow: bool,

    /// Idle poll interval in milliseconds (used with --follow).
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,
}

/// Arguments for `cache-queue stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[arg(short, long)]
    pub biz: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Identifies one batch.
#[derive(Parser, Debug)]
pub struct BatchRef {
    #[arg(short, long)]
    pub biz: String,

    #[arg(long)]
    pub batch: String,
}

/// Arguments for `cache-queue show-batch`.
#[derive(Parser, Debug)]
pub struct ShowBatchArgs {
    #[command(flatten)]
    pub target: BatchRef,

    /// Also print every block with its items.
    #[arg(long)]
    pub blocks: bool,
}

/// Arguments for `cache-queue remove-block`.
#[derive(Parser, Debug)]
pub struct RemoveBlockArgs {
    #[command(flatten)]
    pub target: BatchRef,

    #[arg(long)]
    pub index: usize,
}

/// Arguments for `cache-queue metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Business streams whose pending gauge should be refreshed.
    #[arg(short, long)]
    pub biz: Vec<String>,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    init_metrics()?;

    let store = RedisStore::connect(&config).await?;
    let queue = Arc::new(
        QueueStore::new(store, JsonCodec::<Value>::new()).with_counter_mode(config.counter_mode),
    );

    match cli.command {
        Commands::Submit(args) => run_submit_command(&config, queue, args).await,
        Commands::Drain(args) => run_drain_command(&config, queue, args).await,
        Commands::Stats(args) => run_stats_command(&queue, args).await,
        Commands::ShowBatch(args) => run_show_batch_command(&queue, args).await,
        Commands::RemoveBatch(args) => {
            queue.remove_batch(&args.biz, &args.batch).await?;
            println!("Removed batch {} from {}", args.batch, args.biz);
            Ok(())
        }
        Commands::RemoveBlock(args) => {
            queue
                .remove_block(&args.target.biz, &args.target.batch, args.index)
                .await?;
            println!(
                "Removed block {} of batch {} from {}",
                args.index, args.target.batch, args.target.biz
            );
            Ok(())
        }
        Commands::Metrics(args) => {
            for biz in &args.biz {
                queue.stats(biz).await?;
            }
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<CacheQueueConfig> {
    let config = match path {
        Some(path) => CacheQueueConfig::from_yaml_file(path)?,
        None => CacheQueueConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Reads one JSON value per non-blank line.
fn read_jsonl(path: &Path) -> anyhow::Result<Vec<Value>> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                anyhow::anyhow!("Invalid JSON on line {} of {}: {}", i + 1, path.display(), e)
            })
        })
        .collect()
}

async fn run_submit_command(
    config: &CacheQueueConfig,
    queue: Arc<JsonQueue>,
    args: SubmitArgs,
) -> anyhow::Result<()> {
    let items = read_jsonl(Path::new(&args.file))?;
    let block_size = args
        .block_size
        .unwrap_or_else(|| config.block_size_for(&args.biz));

    let batch = match args.batch_id {
        Some(batch_id) => {
            queue
                .add_batch(&args.biz, &batch_id, block_size, &items)
                .await?
        }
        None => {
            Processor::new(queue, &args.biz, LoggingHandler)
                .init(&items, block_size)
                .await?
        }
    };

    println!(
        "Submitted batch {} ({} items, {} blocks of {})",
        batch.batch_id,
        items.len(),
        batch.block_count,
        batch.block_size
    );
    Ok(())
}

async fn run_drain_command(
    config: &CacheQueueConfig,
    queue: Arc<JsonQueue>,
    args: DrainArgs,
) -> anyhow::Result<()> {
    let processor = Processor::new(queue, &args.biz, LoggingHandler)
        .with_block_size(config.block_size_for(&args.biz));

    if !args.follow {
        let summary = processor.process().await?;
        println!(
            "Processed {} batches ({} completed), {} blocks, {} skipped",
            summary.batches_processed,
            summary.batches_completed,
            summary.blocks_processed,
            summary.blocks_skipped
        );
        return Ok(());
    }

    let pool_config = ConsumerPoolConfig::new(args.consumers.unwrap_or(1))
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    let mut pool = ConsumerPool::new(pool_config, processor);
    pool.start()?;

    info!(biz_id = %args.biz, "Draining until interrupted (Ctrl+C)");
    tokio::signal::ctrl_c().await?;

    pool.shutdown().await?;
    let stats = pool.stats();
    println!(
        "Processed {} blocks ({} failed), {} batches completed",
        stats.blocks_processed, stats.blocks_failed, stats.batches_completed
    );
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    biz_id: String,
    pending_batches: usize,
    pending_blocks: usize,
    batch_ids: Vec<String>,
}

async fn run_stats_command(queue: &JsonQueue, args: StatsArgs) -> anyhow::Result<()> {
    let stats = queue.stats(&args.biz).await?;
    let batch_ids = queue.pending_batch_ids(&args.biz).await?;

    if args.json {
        let report = StatsReport {
            biz_id: stats.biz_id,
            pending_batches: stats.pending_batches,
            pending_blocks: stats.pending_blocks,
            batch_ids,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Business stream: {}", stats.biz_id);
    println!("Pending batches: {}", stats.pending_batches);
    println!("Pending blocks:  {}", stats.pending_blocks);
    for batch_id in batch_ids {
        println!("  {}", batch_id);
    }
    Ok(())
}

fn print_batch(batch: &Batch) {
    println!("Batch:       {}", batch.batch_id);
    println!("Business:    {}", batch.biz_id);
    println!("Started:     {}", batch.start_time.to_rfc3339());
    println!("Block size:  {}", batch.block_size);
    println!(
        "Consumed:    {}/{}{}",
        batch.consumed_block_count,
        batch.block_count,
        if batch.is_completed() { " (completed)" } else { "" }
    );
}

async fn run_show_batch_command(queue: &JsonQueue, args: ShowBatchArgs) -> anyhow::Result<()> {
    let BatchRef { biz, batch: batch_id } = args.target;
    let Some(batch) = queue.get_batch(&biz, &batch_id).await? else {
        return Err(anyhow::anyhow!("Batch {} not found in {}", batch_id, biz));
    };

    print_batch(&batch);
    println!(
        "Pending:     {} blocks",
        queue.pending_blocks(&biz, &batch_id).await?
    );

    if args.blocks {
        for index in 0..batch.block_count {
            match queue.get_block(&biz, &batch_id, index).await? {
                Some(block) => {
                    println!(
                        "\nBlock {} ({} items{})",
                        index,
                        block.len(),
                        if block.consumed { ", consumed" } else { "" }
                    );
                    for item in block.items() {
                        println!("  {}", item);
                    }
                }
                None => println!("\nBlock {} (removed)", index),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_command() {
        let cli = Cli::try_parse_from([
            "cache-queue",
            "submit",
            "--biz",
            "orders",
            "--file",
            "tasks.jsonl",
            "-s",
            "25",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(cli.config.is_none());
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.biz, "orders");
                assert_eq!(args.file, "tasks.jsonl");
                assert_eq!(args.block_size, Some(25));
                assert!(args.batch_id.is_none());
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_drain_defaults_and_global_args() {
        let cli = Cli::try_parse_from([
            "cache-queue",
            "drain",
            "-b",
            "orders",
            "--log-level",
            "debug",
            "--config",
            "queue.yaml",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.config.as_deref(), Some("queue.yaml"));
        match cli.command {
            Commands::Drain(args) => {
                assert_eq!(args.consumers, None);
                assert!(!args.follow);
                assert_eq!(args.poll_interval_ms, 1000);
            }
            _ => panic!("Expected Drain command"),
        }
    }

    #[test]
    fn test_drain_consumers_requires_follow() {
        let result = Cli::try_parse_from(["cache-queue", "drain", "-b", "orders", "-n", "4"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "cache-queue",
            "drain",
            "-b",
            "orders",
            "-n",
            "4",
            "--follow",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Drain(args) => {
                assert_eq!(args.consumers, Some(4));
                assert!(args.follow);
            }
            _ => panic!("Expected Drain command"),
        }
    }

    #[test]
    fn test_remove_block_command() {
        let cli = Cli::try_parse_from([
            "cache-queue",
            "remove-block",
            "--biz",
            "orders",
            "--batch",
            "b1",
            "--index",
            "3",
        ])
        .expect("should parse");

        match cli.command {
            Commands::RemoveBlock(args) => {
                assert_eq!(args.target.biz, "orders");
                assert_eq!(args.target.batch, "b1");
                assert_eq!(args.index, 3);
            }
            _ => panic!("Expected RemoveBlock command"),
        }
    }

    #[test]
    fn test_metrics_accepts_multiple_streams() {
        let cli = Cli::try_parse_from(["cache-queue", "metrics", "-b", "a", "-b", "b"])
            .expect("should parse");
        match cli.command {
            Commands::Metrics(args) => assert_eq!(args.biz, vec!["a", "b"]),
            _ => panic!("Expected Metrics command"),
        }
    }

    #[test]
    fn test_read_jsonl_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "{{\"task\": 1}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "\"Task-2\"").unwrap();

        let items = read_jsonl(file.path()).expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["task"], 1);
        assert_eq!(items[1], Value::String("Task-2".to_string()));
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "1").unwrap();
        writeln!(file, "not json").unwrap();

        let err = read_jsonl(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
