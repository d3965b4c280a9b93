use anyhow::Result;
use async_trait::async_trait;

use crate::io::ChunkSource;
use crate::staging::Record;

/// Database operations the benchmark core relies on.
///
/// Connection strings, authentication and pool sizing stay behind this trait;
/// worker units only ever call these methods.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Round-trip a trivial query to prove the database is reachable
    async fn check_connectivity(&self) -> Result<()>;

    /// Create the target table if it does not exist yet
    async fn ensure_table(&self, table: &str) -> Result<()>;

    /// Insert records with parameterized multi-row statements.
    /// Returns the number of rows written.
    async fn insert_batch(&self, table: &str, records: &[Record]) -> Result<u64>;

    /// Stream a staged artifact into `table` over a dedicated connection.
    ///
    /// Returns the server-reported row count when the protocol exposes one.
    /// The connection is released on every exit path.
    async fn copy_in(&self, table: &str, source: &mut dyn ChunkSource) -> Result<Option<u64>>;

    /// Release pooled connections and background tasks
    async fn close(&self);
}


#[cfg(test)]
mod tests {
    use super::stub::StubConnector;
    use super::*;
    use crate::io::ArtifactReader;
    use crate::staging::{RecordGenerator, RecordSizeRange, StagingWriter};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stub_configured_from_another_module() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.csv");
        let mut generator = RecordGenerator::with_seed(0, 0, 3);
        let mut writer = StagingWriter::create(&path).unwrap();
        for _ in 0..4 {
            writer
                .append(&generator.generate(RecordSizeRange::new(512, 512).unwrap()))
                .unwrap();
        }
        writer.finalize().unwrap();

        let connector = StubConnector {
            copy_delay: Duration::from_millis(1),
            fail_inserts_every: Some(2),
            ..Default::default()
        };

        let header = crate::db::schema::header_line();
        let mut reader = ArtifactReader::open(&path, &header, 256).await.unwrap();
        assert_eq!(connector.copy_in("t", &mut reader).await.unwrap(), Some(4));
        assert_eq!(connector.copy_calls(), 1);
        assert_eq!(connector.max_in_flight(), 1);
        assert_eq!(connector.rows_loaded(), 4);

        let record = generator.generate(RecordSizeRange::new(512, 512).unwrap());
        assert!(connector.insert_batch("t", &[record.clone()]).await.is_ok());
        assert!(connector.insert_batch("t", &[record]).await.is_err());
    }
}
