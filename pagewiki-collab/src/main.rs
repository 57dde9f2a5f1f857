//! pagewiki-collab: realtime page collaboration daemon.
//!
//! Hosts one WebSocket room per page, persists every edit to an append-only
//! log, compacts logs into snapshots through the external merge engine and
//! keeps the search index fresh.

use anyhow::Result;
use clap::Parser;
use pagewiki_collab::{cli::Cli, run_with_cli};

#[tokio::main]
async fn main() -> Result<()> {
    run_with_cli(Cli::parse()).await
}
