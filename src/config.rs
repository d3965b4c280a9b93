//! Configuration constants for the write benchmark
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub const TOKEN_VALIDITY_DURATION: Duration = Duration::from_secs(900); // 15 minutes

/// Postgres caps a single statement at 65535 bind parameters
pub const MAX_BIND_PARAMETERS: usize = 65_535;

// ============================================================================
// Record Configuration
// ============================================================================

/// Default lower bound for the serialized size of a generated record
pub const DEFAULT_MIN_RECORD_BYTES: usize = 50 * 1024; // 50 KB

/// Default upper bound for the serialized size of a generated record
pub const DEFAULT_MAX_RECORD_BYTES: usize = 100 * 1024; // 100 KB

/// Hard cap on filler iterations per record
///
/// Bounds the generation cost of a single record regardless of the requested
/// size. At the fixed filler item size this allows records of roughly 20 MB.
pub const MAX_FILLER_ITEMS: usize = 100_000;

// ============================================================================
// Coordinator Configuration
// ============================================================================

/// Default number of bulk loads allowed in flight at once
pub const DEFAULT_MAX_CONCURRENT_COPIES: usize = 4;

/// Upper bound on copy concurrency when the high-throughput variant is selected
pub const HIGH_THROUGHPUT_COPY_CEILING: usize = 16;

/// Maximum number of distinct error messages kept in a benchmark result
pub const MAX_ERROR_MESSAGES: usize = 10;

pub const DEFAULT_TARGET_TABLE: &str = "bench_records";

// ============================================================================
// Progress Display
// ============================================================================

/// Most recent latencies kept for the live percentile line
pub const PROGRESS_LATENCY_WINDOW: usize = 4096;

/// How often the live percentile line is recomputed
pub const PROGRESS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// I/O Configuration
// ============================================================================

/// Size of chunks streamed into a bulk-ingest command
///
/// 64KB keeps memory per in-flight load small while staying well above the
/// protocol's per-message overhead.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024; // 64 KB

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Buffer size for the staging writer
pub const STAGING_BUFFER_SIZE: usize = 256 * 1024; // 256 KB
