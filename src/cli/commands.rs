//! CLI command implementations for jobrunner.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chron::ChronService;
use crate::runner::{RunnerService, ShellSpawner};
use crate::service::ServiceContext;
use crate::shutdown::install_signal_handlers;

/// jobrunner - Redis job queue runner and chron daemons.
#[derive(Parser)]
#[command(name = "jobrunner")]
#[command(about = "Redis job queue runner and reclamation daemons")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Whether the selected daemon was started with `--verbose`.
    pub fn verbose(&self) -> bool {
        match &self.command {
            Commands::Runner(args) | Commands::Chron(args) => args.verbose,
        }
    }
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler that spawns dispatcher processes for ready queues.
    Runner(DaemonArgs),

    /// Run the periodic reclamation daemon.
    Chron(DaemonArgs),
}

/// Arguments shared by both daemons.
#[derive(clap::Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Path to the JSON configuration file.
    #[arg(long, env = "JOBRUNNER_CONFIG")]
    pub config_file: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Runner(args) => run_runner_command(args).await,
        Commands::Chron(args) => run_chron_command(args).await,
    }
}

fn load_context(args: &DaemonArgs) -> anyhow::Result<ServiceContext> {
    ServiceContext::from_config_file(&args.config_file).with_context(|| {
        format!(
            "Could not load configuration from {}",
            args.config_file.display()
        )
    })
}

async fn run_runner_command(args: DaemonArgs) -> anyhow::Result<()> {
    let ctx = load_context(&args)?;
    if ctx.config.groups.is_empty() {
        anyhow::bail!("No runner groups are configured");
    }

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone()).context("Could not install signal handlers")?;

    let mut service = RunnerService::new(
        &ctx.config,
        ctx.store.clone(),
        Arc::new(ShellSpawner),
        ctx.clock.clone(),
        ctx.stats.clone(),
        ctx.host.clone(),
    );
    service.run(shutdown).await?;
    info!("Runner exited");
    Ok(())
}

async fn run_chron_command(args: DaemonArgs) -> anyhow::Result<()> {
    let ctx = load_context(&args)?;

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone()).context("Could not install signal handlers")?;

    let service = ChronService::new(
        ctx.store.clone(),
        ctx.clock.clone(),
        ctx.stats.clone(),
        ctx.config.limits.clone(),
        ctx.host.clone(),
    );
    service.run(shutdown).await?;
    info!("Chron exited");
    Ok(())
}
