//! Error types for jobrunner operations.
//!
//! Defines the error types for the major subsystems:
//! - Service configuration loading and validation
//! - Queue store access (partition and aggregator servers)
//! - Dispatcher subprocess management

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading the service configuration.
///
/// These are fatal at startup: the daemons never enter their main loop
/// with an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't open configuration file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse JSON file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Empty list for '{0}'.")]
    EmptyServerList(&'static str),

    #[error("No command provided for 'dispatcher'.")]
    MissingDispatcher,

    #[error("Invalid '{field}' value for runner group '{group}'.")]
    InvalidGroup { group: String, field: &'static str },

    #[error("Invalid server address '{0}'")]
    InvalidServer(String),

    #[error("Invalid statsd endpoint '{0}'")]
    InvalidStatsd(String),

    #[error("Invalid limit for '{kind}' on type '{job_type}': {reason}")]
    InvalidLimit {
        kind: &'static str,
        job_type: String,
        reason: String,
    },
}

/// Errors that can occur while talking to the queue stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Every server in an ordered list failed or is marked down.
    #[error("Could not execute command on any servers.")]
    AllServersUnavailable,

    /// The server is inside its cool-down window after a connection failure.
    #[error("Server {0} is marked down")]
    ServerDown(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connect or command timed out.
    #[error("Redis call to {server} timed out after {timeout:?}")]
    Timeout { server: String, timeout: Duration },

    /// Server string could not be turned into a connection address.
    #[error("Invalid server address '{0}'")]
    InvalidServer(String),

    /// The store replied with something the caller cannot interpret.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl StoreError {
    /// Returns true for the "high-availability" failure where no server in
    /// the ordered list could serve the request.
    pub fn is_total_outage(&self) -> bool {
        matches!(self, StoreError::AllServersUnavailable)
    }
}

/// Errors that can occur while managing dispatcher subprocesses.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
