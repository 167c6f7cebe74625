//! Keepsake Daemon - keeps the store open and runs the eviction scheduler

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use keepsake::MemoryService;
use keepsake::config::Config;
use keepsake::error::Result;
use keepsake::storage::PayloadCodec;

/// Keepsake - tiered long-term memory with value-driven eviction
#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Tiered long-term memory with value-driven eviction")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Open the store and run background eviction (default command)
    #[command(name = "serve")]
    Serve,
    /// Print the resolved configuration and exit
    #[command(name = "check-config")]
    CheckConfig,
    /// Print a new payload encryption key for `storage.encryption_key_env`
    #[command(name = "generate-key")]
    GenerateKey,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::CheckConfig) => {
            println!("{config:#?}");
            Ok(())
        }
        Some(Command::GenerateKey) => {
            println!("{}", PayloadCodec::generate_key());
            Ok(())
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,keepsake=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Keepsake daemon");
    tracing::debug!("Config loaded: {:?}", config);

    let service = MemoryService::builder(config).build().await?;
    let scheduler = service.spawn_scheduler();

    shutdown_signal().await;

    match scheduler {
        Some(handle) => handle.shutdown().await,
        None => {
            let rows = service.flush().await?;
            tracing::info!("Flushed {} pending rows", rows);
        }
    }

    tracing::info!("Keepsake daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
