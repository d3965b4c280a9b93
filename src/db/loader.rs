use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::connector::Connector;
use super::schema;
use crate::coordination::outcome::{LoadOutcome, UnitId};
use crate::config::BYTES_PER_MB;
use crate::error::BenchError;
use crate::io::{ArtifactReader, ChunkSource};

/// Streams staged artifacts into the target table with the server-side bulk-ingest protocol.
///
/// Each artifact is attempted exactly once.
#[derive(Clone)]
pub struct BulkLoader {
    connector: Arc<dyn Connector>,
    table: String,
    chunk_size: usize,
}

impl BulkLoader {
    pub fn new(connector: Arc<dyn Connector>, table: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            connector,
            table: table.into(),
            chunk_size,
        }
    }

    /// Load one artifact and report the outcome.
    ///
    /// `expected_rows` is the writer's own count, used when the connector cannot
    /// report how many rows the server accepted.
    pub async fn load(
        &self,
        unit: UnitId,
        artifact: &Path,
        expected_rows: Option<u64>,
    ) -> LoadOutcome {
        let start = Instant::now();
        let mut bytes_streamed = 0;

        let result = self.stream(artifact, &mut bytes_streamed).await;
        let elapsed = start.elapsed();

        match result {
            Ok(reported) => {
                let records = match reported {
                    Some(rows) => rows,
                    None => {
                        debug!(%unit, "connector reported no row count, using staged count");
                        expected_rows.unwrap_or(0)
                    }
                };
                LoadOutcome {
                    unit,
                    success: true,
                    records_inserted: records,
                    data_size_mb: bytes_streamed as f64 / BYTES_PER_MB,
                    elapsed,
                    error: None,
                }
            }
            Err(e) => {
                let error = BenchError::load(unit, e);
                warn!("{}", error);
                LoadOutcome {
                    unit,
                    success: false,
                    records_inserted: 0,
                    data_size_mb: bytes_streamed as f64 / BYTES_PER_MB,
                    elapsed,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn stream(&self, artifact: &Path, bytes_streamed: &mut u64) -> Result<Option<u64>> {
        let mut reader =
            ArtifactReader::open(artifact, &schema::header_line(), self.chunk_size).await?;
        let result = self.connector.copy_in(&self.table, &mut reader).await;
        *bytes_streamed = reader.bytes_read();
        result
    }
}
