// Public API - only expose the runner module
pub mod runner;

// Internal modules - organized by subsystem
mod config;
mod coordination;
mod db;
mod error;
mod io;
mod metrics;
mod results;
mod staging;
mod telemetry;
