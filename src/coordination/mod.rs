//! Worker units and the two-stage coordinator that schedules them

pub mod coordinator;
pub mod outcome;
pub mod worker;

pub use coordinator::{BenchMode, BenchmarkConfigBuilder, Coordinator};
