//! deepscan - recover deleted files from disk images by signature carving
//!
//! Scans a raw image or block device for file headers, validates what it
//! finds and writes the survivors plus a JSON report to a destination.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deepscan::cli::{self, commands, output, Cli, Commands};
use deepscan::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    init_logging(&cli, &config)?;

    let result = match cli.command {
        Some(Commands::Recover(args)) => commands::run_recover(&args, &config).await.map(|_| ()),
        Some(Commands::Devices(args)) => commands::run_devices(&args),
        Some(Commands::Signatures(args)) => commands::run_signatures(&args, &config),
        Some(Commands::Config(args)) => commands::run_config(&args, &config, &config_path),
        Some(Commands::Wizard) | None => cli::wizard::run_wizard(&config).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

/// Compact human logs on stderr, plus JSON lines to a file when asked.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the config's level.
fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("deepscan={level}")))
        .context("Invalid log level")?;

    let log_file = cli.log_file.as_deref().or(config.general.log_file.as_deref());
    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(open_log(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}
