//! High-level runner API for the write benchmark.
//!
//! This module provides a simplified public interface that encapsulates the
//! setup of connections, staging storage and the coordinator.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::Result;
use aws_config::Region;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::coordination::{BenchmarkConfigBuilder, Coordinator};
use crate::db::pool::PoolArgsBuilder;
use crate::db::{self as db_pool, Connector};
use crate::results;

pub use crate::coordination::BenchMode;
pub use crate::metrics::BenchmarkResult;

/// Arguments for running a benchmark
#[derive(Debug, Clone)]
pub struct BenchArgs {
    // Connection configuration
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Static password; IAM token authentication is used when absent
    pub password: Option<String>,
    pub region: Option<String>,
    pub ssl: bool,

    // Workload
    pub mode: BenchMode,
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_step: usize,
    pub connections_per_worker: usize,
    pub batch_size: usize,
    pub test_duration_secs: u64,
    pub warmup_duration_secs: u64,
    pub min_record_bytes: usize,
    pub max_record_bytes: usize,
    pub data_size_mb: f64,
    pub max_concurrent_copies: usize,
    pub high_throughput: bool,
    pub target_table: String,
    pub worker_timeout: Option<Duration>,

    // Declared thresholds, reported but not enforced
    pub max_latency_ms: f64,
    pub min_throughput_mbps: f64,

    // Options
    pub staging_dir: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<crate::db::Pool>,
}

/// Result of a completed benchmark run
#[derive(Debug)]
pub struct BenchOutcome {
    pub result: BenchmarkResult,
    /// Where the JSON result document was written
    pub result_path: PathBuf,
}

/// Run a benchmark with the specified arguments
///
/// This is the main entry point. It handles all the internal setup including:
/// - Creating the connection pool (password or IAM authentication)
/// - Creating a temporary staging directory when none is given
/// - Running the coordinator and writing the result document
///
/// # Example
///
/// ```no_run
/// use dsql_write_bench::runner::{BenchArgs, BenchMode, run_benchmark};
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = BenchArgs {
///     host: "xxx.dsql.us-west-2.on.aws".to_string(),
///     port: 5432,
///     database: "postgres".to_string(),
///     username: "admin".to_string(),
///     password: None,
///     region: Some("us-west-2".to_string()),
///     ssl: true,
///     mode: BenchMode::TwoStage,
///     min_workers: 10,
///     max_workers: 10,
///     worker_step: 1,
///     connections_per_worker: 2,
///     batch_size: 100,
///     test_duration_secs: 60,
///     warmup_duration_secs: 10,
///     min_record_bytes: 50 * 1024,
///     max_record_bytes: 100 * 1024,
///     data_size_mb: 500.0,
///     max_concurrent_copies: 4,
///     high_throughput: false,
///     target_table: "bench_records".to_string(),
///     worker_timeout: None,
///     max_latency_ms: 1000.0,
///     min_throughput_mbps: 1.0,
///     staging_dir: None,
///     results_dir: PathBuf::from("results"),
///     quiet: true,
/// };
///
/// let outcome = run_benchmark(args).await?;
/// println!("{:.2} MB/s", outcome.result.throughput_mbps);
/// # Ok(())
/// # }
/// ```
pub async fn run_benchmark(mut args: BenchArgs) -> Result<BenchOutcome> {
    // Set up staging directory (use temp dir if not provided)
    let (_temp_dir, staging_dir) = if let Some(dir) = args.staging_dir.take() {
        (None, dir)
    } else {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        (Some(temp_dir), path)
    };

    let config = BenchmarkConfigBuilder::default()
        .min_workers(args.min_workers)
        .max_workers(args.max_workers)
        .worker_step(args.worker_step)
        .connections_per_worker(args.connections_per_worker)
        .batch_size(args.batch_size)
        .test_duration_secs(args.test_duration_secs)
        .warmup_duration_secs(args.warmup_duration_secs)
        .min_text_length(args.min_record_bytes)
        .max_text_length(args.max_record_bytes)
        .data_size_mb(args.data_size_mb)
        .max_latency_ms(args.max_latency_ms)
        .min_throughput_mbps(args.min_throughput_mbps)
        .mode(args.mode)
        .max_concurrent_copies(args.max_concurrent_copies)
        .high_throughput(args.high_throughput)
        .target_table(args.target_table.clone())
        .staging_dir(staging_dir)
        .worker_timeout(args.worker_timeout)
        .quiet(args.quiet)
        .build()?;
    config.validate()?;

    // Every unit holds its own connection
    let max_pool_size = config.total_connections().max(1) as u32;

    // Create connection pool (or use test pool if provided)
    #[cfg(test)]
    let pool = if let Some(test_pool) = args.test_pool.take() {
        test_pool
    } else {
        connect(&args, max_pool_size).await?
    };

    #[cfg(not(test))]
    let pool = connect(&args, max_pool_size).await?;

    let connector: Arc<dyn Connector> = Arc::new(pool);
    let run = Coordinator::new(Arc::clone(&connector), config);
    let result = match run {
        Ok(mut coordinator) => coordinator.run().await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    connector.close().await;
    let result = result?;

    let result_path = results::write_result(&args.results_dir, &result).await?;

    Ok(BenchOutcome {
        result,
        result_path,
    })
}

async fn connect(args: &BenchArgs, max_pool_size: u32) -> Result<db_pool::Pool> {
    let mut builder = PoolArgsBuilder::default();
    builder
        .endpoint(&args.host)
        .port(args.port)
        .database(&args.database)
        .username(&args.username)
        .ssl(args.ssl)
        .max_pool_size(max_pool_size);
    if let Some(password) = &args.password {
        builder.password(password);
    }
    if let Some(region) = &args.region {
        builder.region(Region::new(region.clone()));
    }
    db_pool::pool::pool(builder.build()?).await
}
