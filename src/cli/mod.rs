//! Command-line interface for the runner and chron daemons.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, DaemonArgs};
