//! jobrunner: daemons for a partitioned Redis job queue.
//!
//! The runner spawns dispatcher processes for queues listed in the
//! aggregated ready map. The chron daemon sweeps every partition for
//! stale claims and delayed jobs, then republishes the ready map.

pub mod chron;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod runner;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod store;

// Re-export commonly used error types
pub use error::{ConfigError, ProcessError, StoreError};
