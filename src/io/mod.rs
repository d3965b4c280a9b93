//! I/O abstraction layer for streaming staged artifacts

pub mod chunk_source;
pub mod local_reader;

pub use chunk_source::ChunkSource;
pub use local_reader::ArtifactReader;
