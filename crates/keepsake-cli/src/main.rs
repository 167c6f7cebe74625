use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keepsake::MemoryService;
use keepsake::config::Config;
use keepsake_cli::commands::{BackupCommand, CleanupCommand, EvictCommand, MemoryCommand, StatsCommand};
use keepsake_cli::error::CliResult;
use keepsake_cli::output::OutputFormat;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keepsake-cli")]
#[command(about = "Keepsake CLI - inspect and maintain a memory store")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Record management commands")]
    Memory(MemoryCommand),

    #[clap(about = "Show per-tier statistics and thresholds")]
    Stats(StatsCommand),

    #[clap(about = "Run one eviction cycle now")]
    Evict(EvictCommand),

    #[clap(about = "Back up and remove records past the retention window")]
    Cleanup(CleanupCommand),

    #[clap(about = "Backup management commands")]
    Backup(BackupCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    // One-shot commands drive eviction themselves
    config.scheduler.enabled = false;

    let service = MemoryService::builder(config).build().await?;

    let result = match &cli.command {
        Command::Memory(cmd) => cmd.execute(&service, format).await,
        Command::Stats(cmd) => cmd.execute(&service, format).await,
        Command::Evict(cmd) => cmd.execute(&service, format).await,
        Command::Cleanup(cmd) => cmd.execute(&service, format).await,
        Command::Backup(cmd) => cmd.execute(&service, format).await,
    };

    service.flush().await?;
    result
}
