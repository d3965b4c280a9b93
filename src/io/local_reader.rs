use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::chunk_source::ChunkSource;

/// ChunkSource over a staged artifact on local disk.
///
/// The first chunk is checked against the expected header line so a truncated
/// or foreign file is rejected before any row reaches the database.
pub struct ArtifactReader {
    file_path: PathBuf,
    file: File,
    chunk_size: usize,
    expected_header: Vec<u8>,
    bytes_read: u64,
}

impl ArtifactReader {
    pub async fn open(
        file_path: impl AsRef<Path>,
        expected_header: &str,
        chunk_size: usize,
    ) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let file = File::open(&file_path)
            .await
            .with_context(|| format!("Failed to open artifact {}", file_path.display()))?;

        let mut expected_header = expected_header.as_bytes().to_vec();
        expected_header.push(b'\n');

        Ok(Self {
            file_path,
            file,
            chunk_size: chunk_size.max(expected_header.len()),
            expected_header,
            bytes_read: 0,
        })
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn size(&self) -> Result<u64> {
        let size = self.file.metadata().await?.len();
        Ok(size)
    }

    /// Fill `buffer` up to the chunk size or end of file
    async fn fill(&mut self, buffer: &mut BytesMut) -> Result<()> {
        while buffer.len() < self.chunk_size {
            let n = self
                .file
                .read_buf(buffer)
                .await
                .with_context(|| format!("Failed to read artifact {}", self.file_path.display()))?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkSource for ArtifactReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        self.fill(&mut buffer).await?;

        if self.bytes_read == 0 && !buffer.starts_with(&self.expected_header) {
            return Err(anyhow!(
                "Malformed artifact {}: missing or unexpected header",
                self.file_path.display()
            ));
        }

        if buffer.is_empty() {
            return Ok(None);
        }

        self.bytes_read += buffer.len() as u64;
        Ok(Some(buffer.freeze()))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
