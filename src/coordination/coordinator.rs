use anyhow::{Result, anyhow, ensure};
use chrono::Utc;
use derive_builder::Builder;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::outcome::{GenerationOutcome, InsertOutcome, UnitId, WorkerOutcome};
use super::worker::{InsertLoop, WorkerUnit};
use crate::config::{
    BYTES_PER_MB, COPY_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_COPIES, DEFAULT_MAX_RECORD_BYTES,
    DEFAULT_MIN_RECORD_BYTES, DEFAULT_TARGET_TABLE, HIGH_THROUGHPUT_COPY_CEILING,
    PROGRESS_REFRESH_INTERVAL,
};
use crate::db::{BulkLoader, Connector};
use crate::error::BenchError;
use crate::metrics::{self, BenchmarkResult, RunShape};
use crate::staging::{RecordSizeRange, artifact_path};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// How records reach the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BenchMode {
    /// Stage artifacts in parallel, then bulk load them under a concurrency cap
    TwoStage,
    /// Timed loop of in-memory batch inserts, no staging
    SingleStage,
}

impl BenchMode {
    /// Parse mode from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "two-stage" | "two_stage" | "staged" => Ok(BenchMode::TwoStage),
            "single-stage" | "single_stage" | "insert" => Ok(BenchMode::SingleStage),
            _ => Err(anyhow!(
                "Unsupported mode: {}. Supported modes: two-stage, single-stage",
                s
            )),
        }
    }
}

impl fmt::Display for BenchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchMode::TwoStage => write!(f, "two-stage"),
            BenchMode::SingleStage => write!(f, "single-stage"),
        }
    }
}

/// Settings for one benchmark run. Immutable once the coordinator holds it.
#[derive(Debug, Clone, Builder)]
pub struct BenchmarkConfig {
    #[builder(default = "10")]
    pub min_workers: usize,
    /// Accepted but not consulted: a run uses `min_workers` only
    #[builder(default = "10")]
    pub max_workers: usize,
    /// Accepted but not consulted: a run uses `min_workers` only
    #[builder(default = "1")]
    pub worker_step: usize,
    #[builder(default = "1")]
    pub connections_per_worker: usize,
    #[builder(default = "100")]
    pub batch_size: usize,
    #[builder(default = "60")]
    pub test_duration_secs: u64,
    /// Zero skips the warmup phase
    #[builder(default = "10")]
    pub warmup_duration_secs: u64,
    /// Lower bound of a record's serialized size in bytes
    #[builder(default = "DEFAULT_MIN_RECORD_BYTES")]
    pub min_text_length: usize,
    /// Upper bound of a record's serialized size in bytes
    #[builder(default = "DEFAULT_MAX_RECORD_BYTES")]
    pub max_text_length: usize,
    /// Total volume staged across all connections
    #[builder(default = "100.0")]
    pub data_size_mb: f64,
    /// Logged with the run, never enforced
    #[builder(default = "1000.0")]
    pub max_latency_ms: f64,
    /// Logged with the run, never enforced
    #[builder(default = "1.0")]
    pub min_throughput_mbps: f64,
    #[builder(default = "BenchMode::TwoStage")]
    pub mode: BenchMode,
    #[builder(default = "DEFAULT_MAX_CONCURRENT_COPIES")]
    pub max_concurrent_copies: usize,
    /// Derive the copy cap from the connection count instead of `max_concurrent_copies`
    #[builder(default)]
    pub high_throughput: bool,
    #[builder(setter(into), default = "DEFAULT_TARGET_TABLE.to_string()")]
    pub target_table: String,
    #[builder(setter(into))]
    pub staging_dir: PathBuf,
    /// Per worker unit; `None` waits indefinitely
    #[builder(default)]
    pub worker_timeout: Option<Duration>,
    #[builder(default)]
    pub quiet: bool,
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.min_workers > 0, "min_workers must be positive");
        ensure!(
            self.max_workers >= self.min_workers,
            "max_workers ({}) must not be below min_workers ({})",
            self.max_workers,
            self.min_workers
        );
        ensure!(self.worker_step > 0, "worker_step must be positive");
        ensure!(
            self.connections_per_worker > 0,
            "connections_per_worker must be positive"
        );
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.test_duration_secs > 0,
            "test_duration_secs must be positive"
        );
        ensure!(
            self.data_size_mb.is_finite() && self.data_size_mb > 0.0,
            "data_size_mb must be positive"
        );
        ensure!(self.max_latency_ms > 0.0, "max_latency_ms must be positive");
        ensure!(
            self.min_throughput_mbps > 0.0,
            "min_throughput_mbps must be positive"
        );
        ensure!(
            self.max_concurrent_copies > 0,
            "max_concurrent_copies must be positive"
        );
        ensure!(
            !self.target_table.trim().is_empty(),
            "target_table must not be empty"
        );
        self.record_size()?;
        Ok(())
    }

    pub fn total_connections(&self) -> usize {
        self.min_workers * self.connections_per_worker
    }

    pub fn record_size(&self) -> Result<RecordSizeRange> {
        RecordSizeRange::new(self.min_text_length, self.max_text_length)
    }

    /// `floor(target bytes / (connections * average record bytes))`, at least one
    pub fn records_per_connection(&self, record_size: RecordSizeRange) -> u64 {
        let target_bytes = self.data_size_mb * BYTES_PER_MB;
        let per_connection =
            target_bytes / (self.total_connections() as f64 * record_size.average() as f64);
        (per_connection.floor() as u64).max(1)
    }

    /// Number of bulk loads allowed in flight at once
    pub fn copy_concurrency(&self) -> usize {
        if self.high_throughput {
            HIGH_THROUGHPUT_COPY_CEILING.min(self.total_connections())
        } else {
            self.max_concurrent_copies
        }
    }

    fn run_shape(&self) -> RunShape {
        RunShape {
            mode: self.mode,
            workers: self.min_workers,
            connections_per_worker: self.connections_per_worker,
        }
    }

    fn log_settings(&self) {
        info!(
            mode = %self.mode,
            workers = self.min_workers,
            connections_per_worker = self.connections_per_worker,
            data_size_mb = self.data_size_mb,
            max_latency_ms = self.max_latency_ms,
            min_throughput_mbps = self.min_throughput_mbps,
            "Benchmark configuration"
        );
        if self.max_workers != self.min_workers || self.worker_step != 1 {
            warn!(
                "max_workers={} and worker_step={} are not used; running with {} workers",
                self.max_workers, self.worker_step, self.min_workers
            );
        }
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    GeneratingFiles,
    AwaitingGeneration,
    Copying,
    AwaitingCopies,
    Inserting,
    Aggregating,
    CleaningUp,
    Done,
}

/// The Coordinator fans worker units out per stage and reduces their outcomes.
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    config: BenchmarkConfig,
    state: CoordinatorState,
}

impl Coordinator {
    pub fn new(connector: Arc<dyn Connector>, config: BenchmarkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connector,
            config,
            state: CoordinatorState::Idle,
        })
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    fn transition(&mut self, next: CoordinatorState) {
        info!("Coordinator: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the benchmark to completion.
    ///
    /// Per-unit failures are reported inside the result. Only an unreachable
    /// database or a stage that produced nothing to load is an error.
    pub async fn run(&mut self) -> Result<BenchmarkResult, BenchError> {
        self.config.log_settings();

        self.connector
            .check_connectivity()
            .await
            .map_err(|e| BenchError::Connectivity(format!("{e:#}")))?;
        self.connector
            .ensure_table(&self.config.target_table)
            .await
            .map_err(|e| BenchError::Fatal(format!("{e:#}")))?;

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let prog_jh = Self::setup_progress_tracking(&self.config, telemetry_rx);

        // The sender is moved into the stage so the channel closes when the stage returns
        let result = match self.config.mode {
            BenchMode::TwoStage => self.run_two_stage(telemetry_tx).await,
            BenchMode::SingleStage => self.run_single_stage(telemetry_tx).await,
        };

        // Wait for the progress bars to finish so we don't collide output
        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        result
    }

    async fn run_two_stage(
        &mut self,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Result<BenchmarkResult, BenchError> {
        let record_size = self
            .config
            .record_size()
            .map_err(|e| BenchError::Fatal(format!("{e:#}")))?;
        let records_per_connection = self.config.records_per_connection(record_size);
        let staging_dir = self.config.staging_dir.clone();

        // Stage 1: one generation unit per connection, no cap
        self.transition(CoordinatorState::GeneratingFiles);
        info!(
            "Generating {} artifacts of {} records each in {}",
            self.config.total_connections(),
            records_per_connection,
            staging_dir.display()
        );
        let generation_start = Instant::now();
        let units = self.worker_units(&telemetry_tx);
        let generations: Vec<_> = units
            .iter()
            .map(|worker| {
                let path = artifact_path(
                    &staging_dir,
                    worker.unit.worker_id,
                    worker.unit.connection_id,
                    Utc::now(),
                );
                worker.generate(path, records_per_connection, record_size)
            })
            .collect();

        self.transition(CoordinatorState::AwaitingGeneration);
        let generation_outcomes = futures::future::join_all(generations).await;
        let generation_duration = generation_start.elapsed();

        let artifacts: Vec<PathBuf> = generation_outcomes
            .iter()
            .map(|o| o.artifact.clone())
            .collect();
        let (staged, failed): (Vec<GenerationOutcome>, Vec<GenerationOutcome>) =
            generation_outcomes.into_iter().partition(|o| o.success);

        info!(
            "Generation complete: {} staged ({:.2} MB), {} failed in {:.2}s",
            staged.len(),
            staged.iter().map(|o| o.data_size_mb).sum::<f64>(),
            failed.len(),
            generation_duration.as_secs_f64()
        );

        if staged.is_empty() {
            self.transition(CoordinatorState::CleaningUp);
            cleanup(&artifacts).await;
            let first_error = failed
                .iter()
                .find_map(|o| o.error.clone())
                .unwrap_or_default();
            return Err(BenchError::Fatal(format!(
                "all {} generation units failed, nothing to load: {}",
                failed.len(),
                first_error
            )));
        }

        // Stage 2: sequential batches, parallel within a batch
        let batch_size = self.config.copy_concurrency().min(staged.len());
        let batch_count = staged.len().div_ceil(batch_size);
        let loader = BulkLoader::new(
            Arc::clone(&self.connector),
            self.config.target_table.clone(),
            COPY_CHUNK_SIZE,
        );

        let load_start = Instant::now();
        let mut load_outcomes = Vec::with_capacity(staged.len());

        for (index, batch) in staged.chunks(batch_size).enumerate() {
            self.transition(CoordinatorState::Copying);
            let batch_start = Instant::now();
            let loads: Vec<_> = batch
                .iter()
                .map(|generated| {
                    let worker = WorkerUnit::new(
                        generated.unit,
                        self.config.worker_timeout,
                        telemetry_tx.clone(),
                    );
                    let loader = loader.clone();
                    let artifact = generated.artifact.clone();
                    let expected_rows = Some(generated.records_generated);
                    async move { worker.copy(loader, artifact, expected_rows).await }
                })
                .collect();

            self.transition(CoordinatorState::AwaitingCopies);
            let outcomes = futures::future::join_all(loads).await;
            for outcome in &outcomes {
                debug!(
                    unit = %outcome.unit,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    success = outcome.success,
                    "artifact loaded"
                );
            }

            let batch_mb: f64 = outcomes
                .iter()
                .filter(|o| o.success)
                .map(|o| o.data_size_mb)
                .sum();
            let batch_secs = batch_start.elapsed().as_secs_f64();
            let throughput_mbps = if batch_secs > 0.0 {
                batch_mb / batch_secs
            } else {
                0.0
            };
            info!(
                "Copy batch {}/{}: {} artifacts, {:.2} MB in {:.2}s ({:.2} MB/s)",
                index + 1,
                batch_count,
                outcomes.len(),
                batch_mb,
                batch_secs,
                throughput_mbps
            );
            let _ = telemetry_tx.send(TelemetryEvent::CopyBatchCompleted {
                batch: index + 1,
                artifacts: outcomes.len(),
                throughput_mbps,
            });

            load_outcomes.extend(outcomes);
        }
        let load_duration = load_start.elapsed();

        self.transition(CoordinatorState::Aggregating);
        let outcomes: Vec<WorkerOutcome> = failed
            .into_iter()
            .map(WorkerOutcome::Generation)
            .chain(load_outcomes.into_iter().map(WorkerOutcome::Load))
            .collect();
        let result = metrics::aggregate(
            self.config.run_shape(),
            &outcomes,
            load_duration,
            Some(generation_duration),
        );

        self.transition(CoordinatorState::CleaningUp);
        let removed = cleanup(&artifacts).await;
        info!("Removed {} staged artifacts", removed);

        self.transition(CoordinatorState::Done);
        Ok(result)
    }

    async fn run_single_stage(
        &mut self,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Result<BenchmarkResult, BenchError> {
        let settings = InsertLoop {
            table: self.config.target_table.clone(),
            batch_size: self.config.batch_size,
            record_size: self
                .config
                .record_size()
                .map_err(|e| BenchError::Fatal(format!("{e:#}")))?,
            warmup: Duration::from_secs(self.config.warmup_duration_secs),
            test_duration: Duration::from_secs(self.config.test_duration_secs),
        };

        self.transition(CoordinatorState::Inserting);
        info!(
            "Running {} insert loops: {}s warmup, {}s measured, {} records per batch",
            self.config.total_connections(),
            self.config.warmup_duration_secs,
            self.config.test_duration_secs,
            self.config.batch_size
        );
        let connector = Arc::clone(&self.connector);
        let units = self.worker_units(&telemetry_tx);
        let inserts: Vec<_> = units
            .iter()
            .map(|worker| worker.insert(Arc::clone(&connector), settings.clone()))
            .collect();
        let insert_outcomes = futures::future::join_all(inserts).await;

        for outcome in &insert_outcomes {
            debug!(
                unit = %outcome.unit,
                batches = outcome.batches_succeeded,
                failed = outcome.batches_failed,
                p50 = outcome.latency.p50,
                p95 = outcome.latency.p95,
                p99 = outcome.latency.p99,
                "insert loop finished"
            );
        }

        self.transition(CoordinatorState::Aggregating);
        let elapsed = measurement_window(&insert_outcomes);
        let outcomes: Vec<WorkerOutcome> = insert_outcomes
            .into_iter()
            .map(WorkerOutcome::Insert)
            .collect();
        let result = metrics::aggregate(self.config.run_shape(), &outcomes, elapsed, None);

        self.transition(CoordinatorState::Done);
        Ok(result)
    }

    /// One unit per (worker, connection) pair
    fn worker_units(
        &self,
        telemetry_tx: &mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Vec<WorkerUnit> {
        let connections_per_worker = self.config.connections_per_worker;
        (0..self.config.min_workers)
            .flat_map(|worker_id| {
                (0..connections_per_worker).map(move |connection_id| UnitId {
                    worker_id,
                    connection_id,
                })
            })
            .map(|unit| WorkerUnit::new(unit, self.config.worker_timeout, telemetry_tx.clone()))
            .collect()
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        config: &BenchmarkConfig,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if config.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();
        let total_units = config.total_connections() as u64;

        let (staged_bar, loaded_bar) = match config.mode {
            BenchMode::TwoStage => {
                let staged = multi_progress.add(ProgressBar::new(total_units));
                staged.set_style(bar_style(
                    "[{elapsed_precise}] Staged:  [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) | {msg}",
                ));
                let loaded = multi_progress.add(ProgressBar::new(total_units));
                loaded.set_style(bar_style(
                    "[{elapsed_precise}] Loaded:  [{bar:30.green/blue}] {pos}/{len} ({percent}%) | {msg}",
                ));
                (Some(staged), Some(loaded))
            }
            BenchMode::SingleStage => (None, None),
        };

        let bytes_bar = multi_progress.add(ProgressBar::new(0));
        bytes_bar.set_style(bar_style(
            "[{elapsed_precise}] Written: {bytes} | {bytes_per_sec} | {msg}",
        ));

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(bar_style("[{elapsed_precise}] Latency: {msg}"));

        // Spawn telemetry processing task
        Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();
            // Percentiles sort the latency window, so they refresh on a timer
            let mut refresh = tokio::time::interval(PROGRESS_REFRESH_INTERVAL);
            refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let event = tokio::select! {
                    event = telemetry_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = refresh.tick() => {
                        if let Some((p50, p95, p99)) = stats.get_percentiles() {
                            stats_bar.set_message(format!(
                                "p50: {:.1}ms, p95: {:.1}ms, p99: {:.1}ms",
                                p50, p95, p99
                            ));
                        }
                        continue;
                    }
                };
                stats.update(&event);

                if let Some(ref bar) = staged_bar {
                    bar.set_position((stats.artifacts_staged + stats.generation_failures) as u64);
                    if let TelemetryEvent::ArtifactStaged { .. } = &event {
                        bar.set_message(format!(
                            "{} records, {:.1} MB",
                            stats.records_staged,
                            stats.bytes_staged as f64 / BYTES_PER_MB
                        ));
                    }
                }
                if let Some(ref bar) = loaded_bar {
                    bar.set_position((stats.artifacts_loaded + stats.load_failures) as u64);
                    if let TelemetryEvent::CopyBatchCompleted {
                        batch, artifacts, ..
                    } = &event
                    {
                        bar.set_message(format!(
                            "batch {} ({} artifacts) at {:.2} MB/s",
                            batch, artifacts, stats.last_batch_throughput_mbps
                        ));
                    }
                }
                bytes_bar.set_position(stats.bytes_written);
                bytes_bar.set_message(format!("{} records", stats.records_written));
            }

            if let Some(bar) = staged_bar {
                bar.finish();
            }
            if let Some(bar) = loaded_bar {
                bar.finish();
            }
            bytes_bar.finish();

            if let Some((p50, p95, p99)) = stats.get_percentiles() {
                stats_bar.finish_with_message(format!(
                    "p50: {:.1}ms, p95: {:.1}ms, p99: {:.1}ms",
                    p50, p95, p99
                ));
            } else {
                stats_bar.finish();
            }
        }))
    }
}

/// Longest measurement phase among units that completed their loop.
///
/// A failed unit's elapsed time may include warmup, so it never widens the window.
fn measurement_window(outcomes: &[InsertOutcome]) -> Duration {
    outcomes
        .iter()
        .filter(|o| o.success)
        .map(|o| o.elapsed)
        .max()
        .unwrap_or_default()
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Delete staged artifacts and their now-empty unit directories.
///
/// Best effort and idempotent: missing files are skipped and any other error
/// is logged. Returns the number of files removed.
pub async fn cleanup(artifacts: &[PathBuf]) -> usize {
    let mut removed = 0;
    let mut parents = BTreeSet::new();

    for path in artifacts {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged artifact {}: {}", path.display(), e),
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }

    for dir in parents {
        // Only succeeds once the directory is empty
        if let Err(e) = tokio::fs::remove_dir(&dir).await {
            debug!("Keeping {}: {}", dir.display(), e);
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connector::stub::StubConnector;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(staging_dir: &Path, workers: usize) -> BenchmarkConfigBuilder {
        let mut builder = BenchmarkConfigBuilder::default();
        builder
            .min_workers(workers)
            .max_workers(workers)
            .min_text_length(512)
            .max_text_length(1024)
            // Small enough that every connection stages a single record
            .data_size_mb(0.0001)
            .staging_dir(staging_dir)
            .quiet(true);
        builder
    }

    fn staged_files(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return files;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(staged_files(&path));
            } else if path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        files
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(BenchMode::parse("two-stage").unwrap(), BenchMode::TwoStage);
        assert_eq!(BenchMode::parse("SINGLE-STAGE").unwrap(), BenchMode::SingleStage);
        assert!(BenchMode::parse("streaming").is_err());
        assert_eq!(BenchMode::TwoStage.to_string(), "two-stage");
    }

    #[test]
    fn test_config_validation() {
        let dir = TempDir::new().unwrap();
        assert!(config(dir.path(), 2).build().unwrap().validate().is_ok());

        let bad = [
            config(dir.path(), 0).build().unwrap(),
            config(dir.path(), 2).batch_size(0).build().unwrap(),
            config(dir.path(), 2).connections_per_worker(0).build().unwrap(),
            config(dir.path(), 2).data_size_mb(0.0).build().unwrap(),
            config(dir.path(), 2).min_text_length(2048).build().unwrap(),
            // Beyond what the capped filler loop can produce
            config(dir.path(), 2)
                .min_text_length(64 * 1024 * 1024)
                .max_text_length(64 * 1024 * 1024)
                .build()
                .unwrap(),
            config(dir.path(), 2).max_workers(1).build().unwrap(),
            config(dir.path(), 2).test_duration_secs(0).build().unwrap(),
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_records_per_connection() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), 4)
            .connections_per_worker(2)
            .data_size_mb(100.0)
            .build()
            .unwrap();
        let range = RecordSizeRange::new(50 * 1024, 100 * 1024).unwrap();

        // 100 MiB / (8 connections * 75 KiB)
        assert_eq!(config.records_per_connection(range), 170);

        let tiny = RecordSizeRange::new(1, 1).unwrap();
        let config = self::config(dir.path(), 1).data_size_mb(1e-9).build().unwrap();
        assert_eq!(config.records_per_connection(tiny), 1);
    }

    #[test]
    fn test_copy_concurrency() {
        let dir = TempDir::new().unwrap();
        let default = config(dir.path(), 40).build().unwrap();
        assert_eq!(default.copy_concurrency(), DEFAULT_MAX_CONCURRENT_COPIES);

        let high = config(dir.path(), 40).high_throughput(true).build().unwrap();
        assert_eq!(high.copy_concurrency(), HIGH_THROUGHPUT_COPY_CEILING);

        let small = config(dir.path(), 3).high_throughput(true).build().unwrap();
        assert_eq!(small.copy_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_bounded_copy_concurrency() {
        for cap in [1, 3] {
            for artifacts in 1..=cap * 3 {
                let dir = TempDir::new().unwrap();
                let connector = Arc::new(StubConnector {
                    copy_delay: Duration::from_millis(20),
                    ..Default::default()
                });
                let config = config(dir.path(), artifacts)
                    .max_concurrent_copies(cap)
                    .build()
                    .unwrap();

                let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
                let result = coordinator.run().await.unwrap();

                assert_eq!(connector.copy_calls(), artifacts);
                assert!(
                    connector.max_in_flight() <= cap,
                    "{} loads in flight with cap {}",
                    connector.max_in_flight(),
                    cap
                );
                assert!(connector.max_in_flight() >= 1);
                assert_eq!(result.success_count, artifacts as u64);
                assert_eq!(coordinator.state(), CoordinatorState::Done);
            }
        }
    }

    #[tokio::test]
    async fn test_partial_generation_failure() {
        let dir = TempDir::new().unwrap();
        // A regular file where a unit directory should go makes that unit fail
        for worker_id in [2, 5, 7] {
            std::fs::write(dir.path().join(format!("worker-{:03}", worker_id)), b"x").unwrap();
        }
        let connector = Arc::new(StubConnector::default());
        let config = config(dir.path(), 10).build().unwrap();

        let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
        let result = coordinator.run().await.unwrap();

        assert_eq!(connector.copy_calls(), 7);
        assert_eq!(result.success_count, 7);
        assert!(result.error_count >= 3);
        assert_eq!(result.success_rate, 0.7);
        assert_eq!(result.total_connections, 10);
        assert!(
            result.errors[0].contains("Failed to create staging directory"),
            "{:?}",
            result.errors
        );
        assert!(result.generation_duration_secs.is_some());
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_zero_generation_success_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("staging");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let connector = Arc::new(StubConnector::default());
        let config = config(&blocker, 4).build().unwrap();

        let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, BenchError::Fatal(_)), "{:?}", err);
        assert_eq!(connector.copy_calls(), 0);
        assert_ne!(coordinator.state(), CoordinatorState::Copying);
        assert_ne!(coordinator.state(), CoordinatorState::AwaitingCopies);
    }

    #[tokio::test]
    async fn test_unreachable_database_aborts_before_workers() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(StubConnector {
            unreachable: true,
            ..Default::default()
        });
        let config = config(dir.path(), 2).build().unwrap();

        let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, BenchError::Connectivity(_)));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_loads_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(StubConnector {
            fail_copies: true,
            ..Default::default()
        });
        let config = config(dir.path(), 3).build().unwrap();

        let mut coordinator = Coordinator::new(connector, config).unwrap();
        let result = coordinator.run().await.unwrap();

        assert_eq!(result.success_count, 0);
        assert_eq!(result.error_count, 3);
        assert_eq!(result.total_records, 0);
        assert_eq!(result.success_rate, 0.0);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().all(|e| e.contains("COPY rejected by server")));
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_throughput_excludes_generation_time() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(StubConnector {
            copy_delay: Duration::from_millis(200),
            ..Default::default()
        });
        // 100 records of exactly 1000 bytes on one connection
        let config = config(dir.path(), 1)
            .min_text_length(1000)
            .max_text_length(1000)
            .data_size_mb(100_000.0 / BYTES_PER_MB)
            .build()
            .unwrap();

        let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
        let result = coordinator.run().await.unwrap();

        assert_eq!(result.total_records, 100);
        assert_eq!(connector.rows_loaded(), 100);
        assert!(result.elapsed_secs >= 0.2);
        assert_eq!(
            result.throughput_records_per_second,
            100.0 / result.elapsed_secs
        );
        assert!(result.throughput_records_per_second <= 500.0);
    }

    #[tokio::test]
    async fn test_single_stage_run() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(StubConnector {
            insert_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let config = config(dir.path(), 2)
            .connections_per_worker(2)
            .mode(BenchMode::SingleStage)
            .batch_size(5)
            .warmup_duration_secs(0)
            .test_duration_secs(1)
            .build()
            .unwrap();

        let mut coordinator = Coordinator::new(connector.clone(), config).unwrap();
        let result = coordinator.run().await.unwrap();

        assert_eq!(result.mode, BenchMode::SingleStage);
        assert_eq!(result.total_connections, 4);
        assert!(result.success_count > 0);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.total_records, result.success_count * 5);
        assert!(result.p50_latency_ms >= 10.0);
        assert!(result.p50_latency_ms <= result.p99_latency_ms);
        assert_eq!(connector.copy_calls(), 0);
        assert_eq!(coordinator.state(), CoordinatorState::Done);
    }

    #[test]
    fn test_measurement_window_ignores_failed_units() {
        let unit = |worker_id| UnitId {
            worker_id,
            connection_id: 0,
        };
        let completed = |worker_id, secs| InsertOutcome {
            success: true,
            elapsed: Duration::from_secs(secs),
            ..InsertOutcome::failed(unit(worker_id), Duration::ZERO, String::new())
        };

        // A unit that panicked after warmup plus part of its run
        let abandoned = InsertOutcome::failed(unit(0), Duration::from_secs(90), "panicked".into());
        let outcomes = vec![abandoned, completed(1, 60), completed(2, 61)];
        assert_eq!(measurement_window(&outcomes), Duration::from_secs(61));

        let only_failed = vec![InsertOutcome::failed(
            unit(0),
            Duration::from_secs(5),
            "timed out".into(),
        )];
        assert_eq!(measurement_window(&only_failed), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = artifact_path(dir.path(), i, 0, Utc::now());
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, b"id\n").unwrap();
                path
            })
            .collect();

        assert_eq!(cleanup(&paths).await, 3);
        assert_eq!(cleanup(&paths).await, 0);
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(staged_files(dir.path()).is_empty());
    }
}
