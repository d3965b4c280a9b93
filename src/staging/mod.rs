//! Synthetic records and the staged artifacts they are written to

pub mod reader;
pub mod record;
pub mod writer;

pub use record::{COLUMNS, Record, RecordGenerator, RecordSizeRange};
pub use writer::{StagedArtifact, StagingWriter, artifact_path};
