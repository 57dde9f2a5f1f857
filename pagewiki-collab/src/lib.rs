//! Library entrypoint for pagewiki-collab so tests and other binaries can
//! embed the collaboration core without going through the CLI.

pub mod auth;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod manager;
pub mod protocol;
pub mod retention;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::CollabConfig;

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Run the collab daemon using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;
    let cfg = CollabConfig::from_cli(&cli)?;
    server::serve(cfg).await
}
