//! Tidestream CLI - Command-line interface
//!
//! Exercises the streaming scheduler against a simulated engine.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tidestream_core::tracing_setup::{CliLogLevel, TracingOptions, default_logs_dir, init_tracing};

#[derive(Parser)]
#[command(name = "tidestream")]
#[command(about = "Watch torrents while they download")]
#[command(version)]
struct Cli {
    /// Console log level; the log file keeps the full scheduler trace
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run scheduler trace
    #[arg(long, global = true, default_value_os_t = default_logs_dir().to_path_buf())]
    logs_dir: PathBuf,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = TracingOptions::new(cli.log_level.as_tracing_level(), cli.command.torrent_id())
        .with_logs_dir(&cli.logs_dir);
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
