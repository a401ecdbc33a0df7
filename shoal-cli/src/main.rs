//! Shoal CLI - Command-line interface
//!
//! Provides command-line access to the Shoal download engine.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Resumable BitTorrent piece downloader")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::default())]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_file = init_tracing(cli.log_level.as_tracing_level(), Some(&cli.logs_dir))
        .context("Failed to initialise logging")?;
    tracing::debug!(path = %log_file.display(), "Writing trace log");

    match commands::handle_command(cli.command).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) if e.is_user_error() => {
            eprintln!("Error: {}", e.user_message());
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).context("Command failed"),
    }
}
