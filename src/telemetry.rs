use std::collections::VecDeque;

use crate::config::PROGRESS_LATENCY_WINDOW;
use crate::metrics::percentile;

/// Telemetry events sent from worker units to the coordinator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A generation unit finalized its artifact
    ArtifactStaged { records: u64, bytes: u64 },
    /// A generation unit failed
    GenerationFailed,
    /// A bulk load finished, successfully or not
    ArtifactLoaded {
        records: u64,
        bytes: u64,
        duration_ms: f64,
        success: bool,
    },
    /// Every load in a concurrency-capped batch has finished
    CopyBatchCompleted {
        batch: usize,
        artifacts: usize,
        throughput_mbps: f64,
    },
    /// One in-memory insert batch finished
    InsertBatch {
        records: u64,
        bytes: u64,
        latency_ms: f64,
        success: bool,
    },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub artifacts_staged: usize,
    pub records_staged: u64,
    pub bytes_staged: u64,
    pub generation_failures: usize,
    pub artifacts_loaded: usize,
    pub load_failures: usize,
    pub copy_batches_completed: usize,
    pub last_batch_throughput_mbps: f64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub insert_batches: u64,
    pub insert_failures: u64,
    /// Latest successful latencies, at most `PROGRESS_LATENCY_WINDOW`
    pub latencies_ms: VecDeque<f64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::ArtifactStaged { records, bytes } => {
                self.artifacts_staged += 1;
                self.records_staged += records;
                self.bytes_staged += bytes;
            }
            TelemetryEvent::GenerationFailed => {
                self.generation_failures += 1;
            }
            TelemetryEvent::ArtifactLoaded {
                records,
                bytes,
                duration_ms,
                success,
            } => {
                if *success {
                    self.artifacts_loaded += 1;
                    self.records_written += records;
                    self.bytes_written += bytes;
                    self.record_latency(*duration_ms);
                } else {
                    self.load_failures += 1;
                }
            }
            TelemetryEvent::CopyBatchCompleted {
                batch,
                throughput_mbps,
                ..
            } => {
                self.copy_batches_completed = *batch;
                self.last_batch_throughput_mbps = *throughput_mbps;
            }
            TelemetryEvent::InsertBatch {
                records,
                bytes,
                latency_ms,
                success,
            } => {
                self.insert_batches += 1;
                if *success {
                    self.records_written += records;
                    self.bytes_written += bytes;
                    self.record_latency(*latency_ms);
                } else {
                    self.insert_failures += 1;
                }
            }
        }
    }

    fn record_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() == PROGRESS_LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    /// Get p50, p95, p99 over the recent latency window
    pub fn get_percentiles(&self) -> Option<(f64, f64, f64)> {
        if self.latencies_ms.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        Some((
            percentile(&sorted, 0.50),
            percentile(&sorted, 0.95),
            percentile(&sorted, 0.99),
        ))
    }
}
