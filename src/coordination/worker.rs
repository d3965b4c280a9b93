use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::outcome::{
    GenerationOutcome, InsertOutcome, LatencyMeasurement, LoadOutcome, UnitId, duration_ms,
};
use crate::config::BYTES_PER_MB;
use crate::db::{BulkLoader, Connector};
use crate::error::BenchError;
use crate::staging::record::serialized_size;
use crate::staging::{Record, RecordGenerator, RecordSizeRange, StagedArtifact, StagingWriter};
use crate::telemetry::TelemetryEvent;

/// Settings for the timed in-memory insert loop
#[derive(Debug, Clone)]
pub struct InsertLoop {
    pub table: String,
    pub batch_size: usize,
    pub record_size: RecordSizeRange,
    pub warmup: Duration,
    pub test_duration: Duration,
}

/// One isolated unit of parallel work, bound to a single (worker, connection) pair.
///
/// Every stage runs on its own task and shares nothing with sibling units; the
/// only thing that comes back is a typed outcome. A panic inside the task, or
/// the optional timeout elapsing, is reported as a failed outcome.
pub struct WorkerUnit {
    pub unit: UnitId,
    timeout: Option<Duration>,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl WorkerUnit {
    pub fn new(
        unit: UnitId,
        timeout: Option<Duration>,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            unit,
            timeout,
            telemetry_tx,
        }
    }

    /// Stage `record_count` generated records to `artifact`
    pub async fn generate(
        &self,
        artifact: PathBuf,
        record_count: u64,
        record_size: RecordSizeRange,
    ) -> GenerationOutcome {
        let unit = self.unit;
        let start = Instant::now();

        // Aborting a blocking task is a no-op, so the job polls this flag instead
        let cancelled = Arc::new(AtomicBool::new(false));
        let path = artifact.clone();
        let flag = Arc::clone(&cancelled);
        let handle = tokio::task::spawn_blocking(move || {
            stage_records(unit, &path, record_count, record_size, &flag)
        });
        let result = match join_unit(handle, self.timeout).await {
            Ok(staged) => staged.map_err(|e| BenchError::generation(unit, e)),
            Err(reason) => {
                cancelled.store(true, Ordering::Relaxed);
                Err(BenchError::generation(unit, reason))
            }
        };
        let elapsed = start.elapsed();

        match result {
            Ok(staged) => {
                debug!(%unit, rows = staged.rows, bytes = staged.size_bytes, "artifact staged");
                let _ = self.telemetry_tx.send(TelemetryEvent::ArtifactStaged {
                    records: staged.rows,
                    bytes: staged.size_bytes,
                });
                GenerationOutcome {
                    unit,
                    success: true,
                    records_generated: staged.rows,
                    data_size_mb: staged.size_bytes as f64 / BYTES_PER_MB,
                    elapsed,
                    artifact: staged.path,
                    error: None,
                }
            }
            Err(error) => {
                warn!("{}", error);
                let _ = self.telemetry_tx.send(TelemetryEvent::GenerationFailed);
                GenerationOutcome {
                    unit,
                    success: false,
                    records_generated: 0,
                    data_size_mb: 0.0,
                    elapsed,
                    artifact,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    /// Bulk load one staged artifact
    pub async fn copy(
        &self,
        loader: BulkLoader,
        artifact: PathBuf,
        expected_rows: Option<u64>,
    ) -> LoadOutcome {
        let unit = self.unit;
        let start = Instant::now();

        let handle =
            tokio::spawn(async move { loader.load(unit, &artifact, expected_rows).await });
        let outcome = match join_unit(handle, self.timeout).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                let error = BenchError::load(unit, reason);
                warn!("{}", error);
                LoadOutcome {
                    unit,
                    success: false,
                    records_inserted: 0,
                    data_size_mb: 0.0,
                    elapsed: start.elapsed(),
                    error: Some(error.to_string()),
                }
            }
        };

        let _ = self.telemetry_tx.send(TelemetryEvent::ArtifactLoaded {
            records: outcome.records_inserted,
            bytes: (outcome.data_size_mb * BYTES_PER_MB) as u64,
            duration_ms: duration_ms(outcome.elapsed),
            success: outcome.success,
        });
        outcome
    }

    /// Run the warmup and measurement insert loops over `connector`
    pub async fn insert(
        &self,
        connector: Arc<dyn Connector>,
        settings: InsertLoop,
    ) -> InsertOutcome {
        let unit = self.unit;
        let start = Instant::now();
        let telemetry_tx = self.telemetry_tx.clone();

        let handle =
            tokio::spawn(async move { insert_loop(unit, connector, settings, telemetry_tx).await });
        match join_unit(handle, self.timeout).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(%unit, "insert loop failed: {}", reason);
                InsertOutcome::failed(unit, start.elapsed(), reason)
            }
        }
    }
}

/// Await a unit's task, converting a panic or an elapsed timeout into a reason string
async fn join_unit<T>(mut handle: JoinHandle<T>, timeout: Option<Duration>) -> Result<T, String> {
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(format!("timed out after {:?}", limit));
            }
        },
        None => handle.await,
    };

    joined.map_err(|e| {
        if e.is_panic() {
            format!("task panicked: {}", e)
        } else {
            format!("task cancelled: {}", e)
        }
    })
}

/// Write the unit's artifact, stopping between records once `cancelled` is set.
///
/// A cancelled job removes its own file: by then the unit has been reported
/// failed and cleanup may already have run.
fn stage_records(
    unit: UnitId,
    path: &Path,
    record_count: u64,
    record_size: RecordSizeRange,
    cancelled: &AtomicBool,
) -> Result<StagedArtifact> {
    let abandon = || {
        let _ = std::fs::remove_file(path);
        anyhow::anyhow!("generation cancelled for {}", unit)
    };

    let mut generator = RecordGenerator::new(unit.worker_id as i32, unit.connection_id as i32);
    let mut writer = StagingWriter::create(path)?;
    for _ in 0..record_count {
        if cancelled.load(Ordering::Relaxed) {
            drop(writer);
            return Err(abandon());
        }
        writer.append(&generator.generate(record_size))?;
    }
    let staged = writer.finalize()?;
    if cancelled.load(Ordering::Relaxed) {
        return Err(abandon());
    }
    Ok(staged)
}

async fn insert_loop(
    unit: UnitId,
    connector: Arc<dyn Connector>,
    settings: InsertLoop,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
) -> InsertOutcome {
    let mut generator = RecordGenerator::new(unit.worker_id as i32, unit.connection_id as i32);
    let next_batch = |generator: &mut RecordGenerator| -> Vec<Record> {
        (0..settings.batch_size)
            .map(|_| generator.generate(settings.record_size))
            .collect()
    };

    // Warmup: results are discarded
    let warmup_start = Instant::now();
    while warmup_start.elapsed() < settings.warmup {
        let batch = next_batch(&mut generator);
        if let Err(e) = connector.insert_batch(&settings.table, &batch).await {
            debug!(%unit, "warmup batch failed: {:#}", e);
        }
    }

    let mut measurements = Vec::new();
    let mut records_inserted = 0;
    let mut bytes_inserted = 0;

    let start = Instant::now();
    while start.elapsed() < settings.test_duration {
        let batch = next_batch(&mut generator);
        let batch_bytes: usize = batch.iter().map(serialized_size).sum();

        let started_at = Utc::now();
        let batch_start = Instant::now();
        let result = connector.insert_batch(&settings.table, &batch).await;
        let latency = batch_start.elapsed();

        let measurement = match result {
            Ok(rows) => {
                records_inserted += rows;
                bytes_inserted += batch_bytes;
                LatencyMeasurement::new(started_at, latency, None)
            }
            Err(e) => LatencyMeasurement::new(started_at, latency, Some(format!("{:#}", e))),
        };
        debug!(
            %unit,
            start = %measurement.start,
            end = %measurement.end,
            latency_ms = measurement.latency_ms(),
            success = measurement.success,
            "insert batch"
        );
        let _ = telemetry_tx.send(TelemetryEvent::InsertBatch {
            records: if measurement.success { batch.len() as u64 } else { 0 },
            bytes: if measurement.success { batch_bytes as u64 } else { 0 },
            latency_ms: measurement.latency_ms(),
            success: measurement.success,
        });
        measurements.push(measurement);
    }

    InsertOutcome::from_measurements(
        unit,
        measurements,
        records_inserted,
        bytes_inserted as f64 / BYTES_PER_MB,
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COPY_CHUNK_SIZE;
    use crate::db::connector::stub::StubConnector;
    use crate::staging::artifact_path;
    use crate::staging::reader::read_artifact;
    use tempfile::TempDir;

    fn worker(timeout: Option<Duration>) -> (WorkerUnit, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let unit = UnitId {
            worker_id: 1,
            connection_id: 2,
        };
        (WorkerUnit::new(unit, timeout, tx), rx)
    }

    fn small_records() -> RecordSizeRange {
        RecordSizeRange::new(1024, 2048).unwrap()
    }

    #[tokio::test]
    async fn test_generate_stages_artifact() {
        let dir = TempDir::new().unwrap();
        let (worker, mut rx) = worker(None);
        let path = artifact_path(dir.path(), 1, 2, Utc::now());

        let outcome = worker.generate(path.clone(), 12, small_records()).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.records_generated, 12);
        assert_eq!(outcome.artifact, path);
        assert!(outcome.data_size_mb > 0.0);

        let records = read_artifact(&path).unwrap();
        assert_eq!(records.len(), 12);
        assert!(records.iter().all(|r| r.worker_id == 1 && r.connection_id == 2));
        assert!(matches!(
            rx.recv().await,
            Some(TelemetryEvent::ArtifactStaged { records: 12, .. })
        ));
    }

    #[tokio::test]
    async fn test_generate_failure_keeps_artifact_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("worker-001"), b"blocker").unwrap();
        let (worker, _rx) = worker(None);
        let path = artifact_path(dir.path(), 1, 2, Utc::now());

        let outcome = worker.generate(path.clone(), 5, small_records()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.records_generated, 0);
        assert_eq!(outcome.artifact, path);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("generation failed for worker 1 connection 2"));
        assert!(error.contains("Failed to create staging directory"));
    }

    #[tokio::test]
    async fn test_generate_timeout_stops_staging() {
        let dir = TempDir::new().unwrap();
        let (worker, _rx) = worker(Some(Duration::from_millis(5)));
        let path = artifact_path(dir.path(), 1, 2, Utc::now());
        let large = RecordSizeRange::new(64 * 1024, 64 * 1024).unwrap();

        let outcome = worker.generate(path.clone(), 400, large).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));

        // The blocking job notices the timeout at its next record and removes its file
        let deadline = Instant::now() + Duration::from_secs(2);
        while path.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!path.exists(), "staging kept running after the timeout");

        // Nothing reappears once stopped
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!path.exists());
    }

    #[test]
    fn test_stage_records_honours_cancellation() {
        let dir = TempDir::new().unwrap();
        let path = artifact_path(dir.path(), 0, 0, Utc::now());
        let unit = UnitId {
            worker_id: 0,
            connection_id: 0,
        };

        let cancelled = AtomicBool::new(true);
        let err = stage_records(unit, &path, 10, small_records(), &cancelled).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(!path.exists());

        let running = AtomicBool::new(false);
        let staged = stage_records(unit, &path, 10, small_records(), &running).unwrap();
        assert_eq!(staged.rows, 10);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_copy_times_out() {
        let dir = TempDir::new().unwrap();
        let (worker, _rx) = worker(Some(Duration::from_millis(50)));
        let path = artifact_path(dir.path(), 1, 2, Utc::now());
        assert!(worker.generate(path.clone(), 2, small_records()).await.success);

        let connector = Arc::new(StubConnector {
            hang_copies: true,
            ..Default::default()
        });
        let loader = BulkLoader::new(connector, "t", COPY_CHUNK_SIZE);

        let outcome = worker.copy(loader, path, Some(2)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.records_inserted, 0);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_copy_panic_becomes_failed_outcome() {
        let dir = TempDir::new().unwrap();
        let (worker, _rx) = worker(None);
        let path = artifact_path(dir.path(), 1, 2, Utc::now());
        assert!(worker.generate(path.clone(), 2, small_records()).await.success);

        let connector = Arc::new(StubConnector {
            panic_on_copy: true,
            ..Default::default()
        });
        let loader = BulkLoader::new(connector, "t", COPY_CHUNK_SIZE);

        let outcome = worker.copy(loader, path, Some(2)).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_insert_loop_continues_after_failures() {
        let (worker, _rx) = worker(None);
        let connector = Arc::new(StubConnector {
            insert_delay: Duration::from_millis(5),
            fail_inserts_every: Some(3),
            ..Default::default()
        });
        let settings = InsertLoop {
            table: "t".to_string(),
            batch_size: 4,
            record_size: small_records(),
            warmup: Duration::ZERO,
            test_duration: Duration::from_millis(200),
        };

        let outcome = worker.insert(connector, settings).await;

        assert!(outcome.success);
        assert!(outcome.batches_failed > 0);
        assert!(outcome.batches_succeeded > outcome.batches_failed);
        assert_eq!(outcome.records_inserted, outcome.batches_succeeded * 4);
        assert_eq!(outcome.latencies_ms.len() as u64, outcome.batches_succeeded);
        assert_eq!(outcome.errors, vec!["deadlock detected".to_string()]);
        assert!(outcome.elapsed >= Duration::from_millis(200));
    }
}
