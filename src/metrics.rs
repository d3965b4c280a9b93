//! Reduction of worker outcomes into a benchmark result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::coordination::outcome::{ErrorLog, WorkerOutcome, duration_ms};
use crate::coordination::BenchMode;

/// Value at fractional rank `p` (0.0..=1.0) of an ascending slice.
///
/// Index is `floor(n * p)`, clamped to the last element. Returns 0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Latency distribution in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencySummary {
    /// Summarize samples in any order; the input is not modified
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        Self {
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }
}

/// Final aggregate of one benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub timestamp: DateTime<Utc>,
    pub mode: BenchMode,
    pub workers: usize,
    pub connections_per_worker: usize,
    pub total_connections: usize,
    pub total_records: u64,
    pub total_data_size_mb: f64,
    pub throughput_mbps: f64,
    pub throughput_records_per_second: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub errors: Vec<String>,
    /// Time spent staging artifacts; excluded from throughput
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub generation_duration_secs: Option<f64>,
    /// Throughput denominator: the load stage, or the measurement phase of the insert loop
    pub elapsed_secs: f64,
}

/// Shape of the run being aggregated
#[derive(Debug, Clone, Copy)]
pub struct RunShape {
    pub mode: BenchMode,
    pub workers: usize,
    pub connections_per_worker: usize,
}

/// Reduce outcomes into a [`BenchmarkResult`].
///
/// Successful loads and successful insert batches count as successes. Failed
/// generations, failed loads, failed batches and failed units count as errors;
/// successful generations are intermediate and not counted. Latency
/// percentiles are computed over successful operations only.
pub fn aggregate(
    shape: RunShape,
    outcomes: &[WorkerOutcome],
    elapsed: Duration,
    generation_duration: Option<Duration>,
) -> BenchmarkResult {
    let mut total_records = 0u64;
    let mut total_data_size_mb = 0.0;
    let mut success_count = 0u64;
    let mut error_count = 0u64;
    let mut latencies_ms = Vec::new();
    let mut errors = ErrorLog::default();

    for outcome in outcomes {
        match outcome {
            WorkerOutcome::Generation(generation) => {
                if !generation.success {
                    error_count += 1;
                    if let Some(error) = &generation.error {
                        errors.push(error);
                    }
                }
            }
            WorkerOutcome::Load(load) => {
                if load.success {
                    success_count += 1;
                    total_records += load.records_inserted;
                    total_data_size_mb += load.data_size_mb;
                    latencies_ms.push(duration_ms(load.elapsed));
                } else {
                    error_count += 1;
                    if let Some(error) = &load.error {
                        errors.push(error);
                    }
                }
            }
            WorkerOutcome::Insert(insert) => {
                success_count += insert.batches_succeeded;
                error_count += insert.batches_failed;
                if !insert.success {
                    error_count += 1;
                }
                total_records += insert.records_inserted;
                total_data_size_mb += insert.data_size_mb;
                latencies_ms.extend_from_slice(&insert.latencies_ms);
                for error in &insert.errors {
                    errors.push(error);
                }
            }
        }
    }

    let elapsed_secs = elapsed.as_secs_f64();
    let per_second = |value: f64| {
        if elapsed_secs > 0.0 {
            value / elapsed_secs
        } else {
            0.0
        }
    };
    let attempts = success_count + error_count;
    let latency = LatencySummary::from_samples(&latencies_ms);

    BenchmarkResult {
        timestamp: Utc::now(),
        mode: shape.mode,
        workers: shape.workers,
        connections_per_worker: shape.connections_per_worker,
        total_connections: shape.workers * shape.connections_per_worker,
        total_records,
        total_data_size_mb,
        throughput_mbps: per_second(total_data_size_mb),
        throughput_records_per_second: per_second(total_records as f64),
        avg_latency_ms: latency.avg,
        p50_latency_ms: latency.p50,
        p95_latency_ms: latency.p95,
        p99_latency_ms: latency.p99,
        min_latency_ms: latency.min,
        max_latency_ms: latency.max,
        success_count,
        error_count,
        success_rate: if attempts > 0 {
            success_count as f64 / attempts as f64
        } else {
            0.0
        },
        errors: errors.into_messages(),
        generation_duration_secs: generation_duration.map(|d| d.as_secs_f64()),
        elapsed_secs,
    }
}
