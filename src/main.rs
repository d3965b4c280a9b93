use dsql_write_bench::runner::{BenchArgs, BenchMode, BenchmarkResult, run_benchmark};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    Run {
        /// Database host (for DSQL: xxx.dsql.REGION.on.aws)
        #[arg(long, env = "BENCH_DB_HOST")]
        host: String,

        /// Database port
        #[arg(long, env = "BENCH_DB_PORT", default_value = "5432")]
        port: u16,

        /// Database name
        #[arg(long, env = "BENCH_DB_NAME", default_value = "postgres")]
        database: String,

        /// Database username
        #[arg(short, long, env = "BENCH_DB_USER", default_value = "admin")]
        username: String,

        /// Static password; IAM token authentication is used when omitted
        #[arg(long, env = "BENCH_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// AWS region for IAM authentication (inferred from a DSQL host if not specified)
        #[arg(short, long, env = "BENCH_REGION")]
        region: Option<String>,

        /// Disable TLS
        #[arg(long, env = "BENCH_NO_SSL")]
        no_ssl: bool,

        /// Benchmark mode (two-stage, single-stage)
        #[arg(short, long, env = "BENCH_MODE", default_value = "two-stage")]
        mode: String,

        /// Number of workers
        #[arg(short, long, env = "BENCH_MIN_WORKERS", default_value = "10")]
        workers: usize,

        /// Upper bound of a worker sweep (accepted, not used)
        #[arg(long, env = "BENCH_MAX_WORKERS")]
        max_workers: Option<usize>,

        /// Step of a worker sweep (accepted, not used)
        #[arg(long, env = "BENCH_WORKER_STEP", default_value = "1")]
        worker_step: usize,

        /// Connections opened by each worker
        #[arg(short, long, env = "BENCH_CONNECTIONS_PER_WORKER", default_value = "1")]
        connections_per_worker: usize,

        /// Records per insert in single-stage mode
        #[arg(short, long, env = "BENCH_BATCH_SIZE", default_value = "100")]
        batch_size: usize,

        /// Measured duration in seconds (single-stage mode)
        #[arg(long, env = "BENCH_TEST_DURATION", default_value = "60")]
        test_duration: u64,

        /// Warmup duration in seconds (single-stage mode)
        #[arg(long, env = "BENCH_WARMUP_DURATION", default_value = "10")]
        warmup_duration: u64,

        /// Smallest serialized record (e.g., 512B, 50KB)
        #[arg(long, env = "BENCH_MIN_RECORD_SIZE", default_value = "50KB")]
        min_record_size: String,

        /// Largest serialized record (e.g., 100KB, 1MB)
        #[arg(long, env = "BENCH_MAX_RECORD_SIZE", default_value = "100KB")]
        max_record_size: String,

        /// Total data staged across all connections, in MB (two-stage mode)
        #[arg(short, long, env = "BENCH_DATA_SIZE_MB", default_value = "100")]
        data_size_mb: f64,

        /// Bulk loads allowed in flight at once (two-stage mode)
        #[arg(long, env = "BENCH_MAX_CONCURRENT_COPIES", default_value = "4")]
        max_concurrent_copies: usize,

        /// Derive the copy concurrency from the connection count
        #[arg(long, env = "BENCH_HIGH_THROUGHPUT")]
        high_throughput: bool,

        /// Target table name
        #[arg(short, long, env = "BENCH_TABLE", default_value = "bench_records")]
        table: String,

        /// Abandon a worker unit after this many seconds
        #[arg(long, env = "BENCH_WORKER_TIMEOUT")]
        worker_timeout: Option<u64>,

        /// Declared latency threshold in ms (reported, not enforced)
        #[arg(long, env = "BENCH_MAX_LATENCY_MS", default_value = "1000")]
        max_latency_ms: f64,

        /// Declared throughput threshold in MB/s (reported, not enforced)
        #[arg(long, env = "BENCH_MIN_THROUGHPUT_MBPS", default_value = "1")]
        min_throughput_mbps: f64,

        /// Directory for staged artifacts (default: system temp directory)
        #[arg(long, env = "BENCH_STAGING_DIR")]
        staging_dir: Option<String>,

        /// Directory the JSON result is written to
        #[arg(long, env = "BENCH_RESULTS_DIR", default_value = "results")]
        results_dir: String,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            host,
            port,
            database,
            username,
            password,
            region,
            no_ssl,
            mode,
            workers,
            max_workers,
            worker_step,
            connections_per_worker,
            batch_size,
            test_duration,
            warmup_duration,
            min_record_size,
            max_record_size,
            data_size_mb,
            max_concurrent_copies,
            high_throughput,
            table,
            worker_timeout,
            max_latency_ms,
            min_throughput_mbps,
            staging_dir,
            results_dir,
            quiet,
        } => {
            // Initialize tracing based on quiet mode
            use tracing_subscriber::{EnvFilter, FmtSubscriber};
            let filter = if quiet {
                EnvFilter::new("dsql_write_bench=warn,sqlx=off")
            } else {
                EnvFilter::new("dsql_write_bench=info,sqlx=off")
            };
            let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);

            let mode = BenchMode::parse(&mode)?;

            if !quiet {
                println!("DSQL Write Benchmark");
                println!("====================");
                println!("Host: {}", host);
                println!("Mode: {}", mode);
                println!("Workers: {} x {} connections", workers, connections_per_worker);
                println!("Table: {}", table);
                println!();
            }

            // IAM authentication needs a region; a password makes it optional
            let region = match (region, &password) {
                (Some(r), _) => Some(r),
                (None, Some(_)) => None,
                (None, None) => {
                    Some(cli::extract_region_from_endpoint(&host).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Could not extract region from host '{}'.\n\
                             Expected format: xxx.dsql.REGION.on.aws (e.g., xxx.dsql.us-east-1.on.aws)\n\
                             Please specify --region or --password explicitly.",
                            host
                        )
                    })?)
                }
            };

            let min_record_bytes = cli::parse_size_string(&min_record_size).map_err(|e| {
                anyhow::anyhow!("Invalid minimum record size '{}': {}", min_record_size, e)
            })?;
            let max_record_bytes = cli::parse_size_string(&max_record_size).map_err(|e| {
                anyhow::anyhow!("Invalid maximum record size '{}': {}", max_record_size, e)
            })?;

            let bench_args = BenchArgs {
                host,
                port,
                database,
                username,
                password,
                region,
                ssl: !no_ssl,
                mode,
                min_workers: workers,
                max_workers: max_workers.unwrap_or(workers),
                worker_step,
                connections_per_worker,
                batch_size,
                test_duration_secs: test_duration,
                warmup_duration_secs: warmup_duration,
                min_record_bytes: min_record_bytes as usize,
                max_record_bytes: max_record_bytes as usize,
                data_size_mb,
                max_concurrent_copies,
                high_throughput,
                target_table: table,
                worker_timeout: worker_timeout.map(Duration::from_secs),
                max_latency_ms,
                min_throughput_mbps,
                staging_dir: staging_dir.map(PathBuf::from),
                results_dir: PathBuf::from(results_dir),
                quiet,
            };

            let outcome = run_benchmark(bench_args).await?;
            print_summary(&outcome.result);
            println!();
            println!("Results written to {}", outcome.result_path.display());
        }
    }
    Ok(())
}

fn print_summary(result: &BenchmarkResult) {
    println!();
    println!("Benchmark Summary");
    println!("=================");
    println!("Mode: {}", result.mode);
    println!(
        "Connections: {} ({} workers x {})",
        result.total_connections, result.workers, result.connections_per_worker
    );
    println!("Records written: {}", result.total_records);
    println!("Data written: {:.2} MB", result.total_data_size_mb);
    if let Some(generation_secs) = result.generation_duration_secs {
        println!("Generation time: {:.2}s", generation_secs);
    }
    println!("Elapsed: {:.2}s", result.elapsed_secs);
    println!(
        "Throughput: {:.2} MB/s, {:.2} records/sec",
        result.throughput_mbps, result.throughput_records_per_second
    );
    println!();
    println!("{:<8} {:>12}", "Latency", "ms");
    for (label, value) in [
        ("avg", result.avg_latency_ms),
        ("p50", result.p50_latency_ms),
        ("p95", result.p95_latency_ms),
        ("p99", result.p99_latency_ms),
        ("min", result.min_latency_ms),
        ("max", result.max_latency_ms),
    ] {
        println!("{:<8} {:>12.2}", label, value);
    }
    println!();
    println!(
        "Success rate: {:.1}% ({} succeeded, {} failed)",
        result.success_rate * 100.0,
        result.success_count,
        result.error_count
    );

    if !result.errors.is_empty() {
        println!();
        println!("Errors (first {}):", result.errors.len());
        for error in &result.errors {
            println!("  - {}", error);
        }
    }
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    /// Parse human-readable size strings like "512B", "50KB", "1MB"
    pub fn parse_size_string(s: &str) -> anyhow::Result<u64> {
        let s = s.trim().to_uppercase();

        let (number_part, unit_part) = if let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) {
            s.split_at(pos)
        } else {
            // No unit, assume bytes
            return s
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("Invalid size: {}", e));
        };

        let number: u64 = number_part
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid size number '{}': {}", number_part, e))?;

        let multiplier = match unit_part.trim() {
            "B" => 1,
            "KB" => 1024,
            "MB" => 1024 * 1024,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid size unit '{}'. Valid units: B, KB, MB",
                    unit_part
                ));
            }
        };

        number
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow::anyhow!("Size '{}' is too large", s))
    }

    /// Extract region from DSQL endpoint format: xxx.dsql.{region}.on.aws
    pub fn extract_region_from_endpoint(endpoint: &str) -> Option<String> {
        let parts: Vec<&str> = endpoint.split('.').collect();
        if parts.len() >= 5
            && parts[1].contains("dsql")
            && parts[parts.len() - 2] == "on"
            && parts[parts.len() - 1] == "aws"
        {
            Some(parts[2].to_string())
        } else {
            None
        }
    }

}
