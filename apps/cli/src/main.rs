//! Moood CLI: journal entry ingestion and analysis pipeline.
//!
//! Stores entries, streams them through the configured analysis workers,
//! and persists the merged metadata.

mod commands;
mod server;

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
