//! Shoal CLI - Command-line interface
//!
//! Runs trackers and peers, shares files and downloads content.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Tracker-coordinated peer-to-peer file distribution")]
struct Cli {
    /// Console log level (RUST_LOG overrides it)
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.into(), cli.logs_dir.as_deref())?;

    if let Err(e) = commands::handle_command(cli.command).await {
        tracing::error!("{e}");
        anyhow::bail!(e.user_message());
    }

    Ok(())
}
