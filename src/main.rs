mod analyzer;
mod cli;
mod config;
mod database;
mod docker;
mod error;
mod github;
mod reproducer;
mod workflow;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting BugSwarm - CI Build Pair Reproducer");
    cli.execute().await?;

    Ok(())
}
