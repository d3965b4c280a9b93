//! Typed results reported by worker units

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::MAX_ERROR_MESSAGES;
use crate::metrics::LatencySummary;

/// Identity of a worker unit: one (worker, connection) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    pub worker_id: usize,
    pub connection_id: usize,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} connection {}", self.worker_id, self.connection_id)
    }
}

/// Timing of one atomic insert or load operation
#[derive(Debug, Clone)]
pub struct LatencyMeasurement {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub latency: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl LatencyMeasurement {
    pub fn new(start: DateTime<Utc>, latency: Duration, error: Option<String>) -> Self {
        Self {
            start,
            end: Utc::now(),
            latency,
            success: error.is_none(),
            error,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        duration_ms(self.latency)
    }
}

/// Milliseconds as a float, exact for whole-millisecond durations
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Result of staging one artifact
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub unit: UnitId,
    pub success: bool,
    pub records_generated: u64,
    pub data_size_mb: f64,
    pub elapsed: Duration,
    /// Set even on failure so a partially written file is still cleaned up
    pub artifact: PathBuf,
    pub error: Option<String>,
}

/// Result of bulk loading one artifact
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub unit: UnitId,
    pub success: bool,
    pub records_inserted: u64,
    pub data_size_mb: f64,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Result of one unit's timed in-memory insert loop
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub unit: UnitId,
    /// False only when the unit itself failed (panic or timeout)
    pub success: bool,
    pub records_inserted: u64,
    pub data_size_mb: f64,
    /// Duration of the measurement phase; for a failed unit, time until it was abandoned
    pub elapsed: Duration,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    /// Latencies of successful batches
    pub latencies_ms: Vec<f64>,
    /// This unit's own percentile summary over `latencies_ms`
    pub latency: LatencySummary,
    /// Distinct error messages, capped
    pub errors: Vec<String>,
}

impl InsertOutcome {
    /// Summarize a unit's measurements. The measurements themselves are not kept.
    pub fn from_measurements(
        unit: UnitId,
        measurements: Vec<LatencyMeasurement>,
        records_inserted: u64,
        data_size_mb: f64,
        elapsed: Duration,
    ) -> Self {
        let mut latencies_ms = Vec::new();
        let mut errors = ErrorLog::default();
        let mut batches_failed = 0;

        for measurement in &measurements {
            if measurement.success {
                latencies_ms.push(measurement.latency_ms());
            } else {
                batches_failed += 1;
                if let Some(error) = &measurement.error {
                    errors.push(error);
                }
            }
        }

        Self {
            unit,
            success: true,
            records_inserted,
            data_size_mb,
            elapsed,
            batches_succeeded: latencies_ms.len() as u64,
            batches_failed,
            latency: LatencySummary::from_samples(&latencies_ms),
            latencies_ms,
            errors: errors.into_messages(),
        }
    }

    /// Outcome of a unit that never reported its measurements
    pub fn failed(unit: UnitId, elapsed: Duration, error: String) -> Self {
        Self {
            unit,
            success: false,
            records_inserted: 0,
            data_size_mb: 0.0,
            elapsed,
            batches_succeeded: 0,
            batches_failed: 0,
            latencies_ms: Vec::new(),
            latency: LatencySummary::default(),
            errors: vec![error],
        }
    }
}

/// Any worker unit's final report
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Generation(GenerationOutcome),
    Load(LoadOutcome),
    Insert(InsertOutcome),
}

/// First-N distinct error messages, in order of appearance
#[derive(Debug, Default)]
pub struct ErrorLog {
    messages: Vec<String>,
}

impl ErrorLog {
    pub fn push(&mut self, message: &str) {
        if self.messages.len() < MAX_ERROR_MESSAGES && !self.messages.iter().any(|m| m == message) {
            self.messages.push(message.to_string());
        }
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}
