//! Error taxonomy for a benchmark run

use thiserror::Error;

use crate::coordination::outcome::UnitId;

/// Errors raised by the benchmark core.
///
/// `Generation` and `Load` never escape a worker unit; they are rendered into
/// the unit's outcome. Only `Fatal` and `Connectivity` abort a run.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("generation failed for {unit}: {message}")]
    Generation { unit: UnitId, message: String },

    #[error("load failed for {unit}: {message}")]
    Load { unit: UnitId, message: String },

    #[error("benchmark aborted: {0}")]
    Fatal(String),

    #[error("database is unreachable: {0}")]
    Connectivity(String),
}

impl BenchError {
    pub fn generation(unit: UnitId, err: impl std::fmt::Display) -> Self {
        BenchError::Generation {
            unit,
            message: format!("{err:#}"),
        }
    }

    pub fn load(unit: UnitId, err: impl std::fmt::Display) -> Self {
        BenchError::Load {
            unit,
            message: format!("{err:#}"),
        }
    }
}
