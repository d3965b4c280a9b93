use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::record::{COLUMNS, Record};
use crate::config::STAGING_BUFFER_SIZE;

/// A finalized staged artifact, safe to hand to a bulk loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub rows: u64,
    pub size_bytes: u64,
}

/// Path of the artifact for one worker unit.
///
/// Layout: `{staging_dir}/worker-{worker_id:03}/conn-{connection_id:03}-{millis}.csv`
pub fn artifact_path(
    staging_dir: &Path,
    worker_id: usize,
    connection_id: usize,
    created_at: DateTime<Utc>,
) -> PathBuf {
    staging_dir
        .join(format!("worker-{:03}", worker_id))
        .join(format!(
            "conn-{:03}-{}.csv",
            connection_id,
            created_at.timestamp_millis()
        ))
}

/// Writes records to a CSV artifact with a header row.
///
/// Fields containing a comma, quote or line break are quoted with embedded
/// quotes doubled. The artifact is only well-formed after [`StagingWriter::finalize`].
pub struct StagingWriter {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    rows: u64,
}

impl StagingWriter {
    /// Create the artifact (and any missing parent directories) and write the header
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create staging directory {}", parent.display())
            })?;
        }

        let file = File::create(&path)
            .with_context(|| format!("Failed to create artifact {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(BufWriter::with_capacity(STAGING_BUFFER_SIZE, file));

        writer
            .write_record(COLUMNS)
            .context("Failed to write artifact header")?;

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        self.writer
            .write_record(record.to_row())
            .with_context(|| format!("Failed to write row to {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close the artifact, returning its final size
    pub fn finalize(self) -> Result<StagedArtifact> {
        let buffered = self
            .writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush artifact: {}", e.error()))?;
        let file = buffered
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush artifact: {}", e.error()))?;
        file.sync_all().context("Failed to sync artifact to disk")?;

        let size_bytes = file
            .metadata()
            .context("Failed to read artifact metadata")?
            .len();

        Ok(StagedArtifact {
            path: self.path,
            rows: self.rows,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::record::{RecordGenerator, RecordSizeRange};
    use tempfile::TempDir;

    #[test]
    fn test_artifact_path_is_unique_per_unit() {
        let dir = Path::new("/tmp/stage");
        let now = Utc::now();

        let a = artifact_path(dir, 1, 0, now);
        let b = artifact_path(dir, 1, 1, now);
        let c = artifact_path(dir, 2, 0, now);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/tmp/stage/worker-001"));
        assert!(a.to_string_lossy().ends_with(".csv"));
    }

    #[test]
    fn test_write_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("artifact.csv");
        let mut generator = RecordGenerator::with_seed(0, 0, 3);
        let range = RecordSizeRange::new(1024, 2048).unwrap();

        let mut writer = StagingWriter::create(&path).unwrap();
        for _ in 0..5 {
            writer.append(&generator.generate(range)).unwrap();
        }
        let artifact = writer.finalize().unwrap();

        assert_eq!(artifact.rows, 5);
        assert_eq!(artifact.path, path);
        assert_eq!(
            artifact.size_bytes,
            std::fs::metadata(&path).unwrap().len()
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let header = contents.lines().next().unwrap();
        assert_eq!(header, COLUMNS.join(","));
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn test_quotes_fields_with_special_characters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quoted.csv");
        let mut record = RecordGenerator::with_seed(0, 0, 1)
            .generate(RecordSizeRange::new(512, 512).unwrap());
        record.description = "say \"hi\", then\nleave".to_string();

        let mut writer = StagingWriter::create(&path).unwrap();
        writer.append(&record).unwrap();
        writer.finalize().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"say \"\"hi\"\", then\nleave\""));
    }

    #[test]
    fn test_create_fails_when_parent_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("worker-000");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let Err(err) = StagingWriter::create(blocker.join("conn-000.csv")) else {
            panic!("artifact created under a regular file");
        };
        assert!(format!("{:#}", err).contains("Failed to create staging directory"));
    }
}
