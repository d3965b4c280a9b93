//! Persistence of benchmark results as one JSON document per run

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::metrics::BenchmarkResult;

/// `benchmark-<ISO-8601 timestamp>.json` with `:` and `.` replaced by `-`
pub fn result_file_name(timestamp: &DateTime<Utc>) -> String {
    let iso = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("benchmark-{}.json", iso.replace([':', '.'], "-"))
}

/// Write `result` into `dir`, creating it if needed. Returns the file path.
pub async fn write_result(dir: &Path, result: &BenchmarkResult) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create results directory {}", dir.display()))?;

    let path = dir.join(result_file_name(&result.timestamp));
    let json =
        serde_json::to_string_pretty(result).context("Failed to serialize benchmark result")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write results to {}", path.display()))?;

    info!("Results written to {}", path.display());
    Ok(path)
}
