//! Antfarm entry point.
//!
//! Loads the farm config, starts the fleet, and runs until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use antfarm::config;
use antfarm::farm::AntFarm;

/// Antfarm -- simulated Sia network orchestrator
#[derive(Parser, Debug)]
#[command(name = "antfarm", about = "Simulated Sia network orchestrator")]
struct Cli {
    /// Path to the farm config JSON file
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("antfarm: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load_config(&cli.config)?;
    let farm = AntFarm::new(config).await?;
    info!("antfarm running, Ctrl-C to stop");

    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    farm.close().await
}
