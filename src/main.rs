//! jobrunner CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = jobrunner::cli::parse_cli();

    jobrunner::logging::init_logging(&cli.log_level, cli.verbose());

    jobrunner::cli::run_with_cli(cli).await
}
