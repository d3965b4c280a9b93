use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Abstraction for streaming a byte source in bounded chunks.
///
/// A bulk-ingest connection pulls from this until it returns `None`, so the
/// whole source never has to be held in memory.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk of at most the source's chunk size, or `None` at end of input
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Bytes handed out so far
    fn bytes_read(&self) -> u64;
}

/// Drain a source into a single buffer
#[cfg_attr(not(test), allow(dead_code))]
pub async fn read_to_end(source: &mut dyn ChunkSource) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    while let Some(chunk) = source.next_chunk().await? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory ChunkSource for testing
    struct MockChunkSource {
        data: Vec<u8>,
        chunk_size: usize,
        offset: usize,
    }

    #[async_trait]
    impl ChunkSource for MockChunkSource {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            if self.offset >= self.data.len() {
                return Ok(None);
            }
            let end = std::cmp::min(self.offset + self.chunk_size, self.data.len());
            let chunk = Bytes::copy_from_slice(&self.data[self.offset..end]);
            self.offset = end;
            Ok(Some(chunk))
        }

        fn bytes_read(&self) -> u64 {
            self.offset as u64
        }
    }

    #[tokio::test]
    async fn test_read_to_end_concatenates_chunks() {
        let data = b"line1\nline2\nline3\n".to_vec();
        let mut source = MockChunkSource {
            data: data.clone(),
            chunk_size: 4,
            offset: 0,
        };

        let buffer = read_to_end(&mut source).await.unwrap();
        assert_eq!(buffer, data);
        assert_eq!(source.bytes_read(), data.len() as u64);
    }
}
