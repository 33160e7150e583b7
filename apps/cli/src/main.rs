//! ContentMigrator CLI: resumable, rate-limited content migration.
//!
//! Moves items from a content source into a destination database,
//! enriching them along the way. Progress lives in a JSON ledger, so an
//! interrupted run picks up where it stopped.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
