//! Command handlers for the `deepscan` binary

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::ProgressBar;
use serde::Serialize;

use super::output::{self, StatusIcons};
use super::{ConfigAction, ConfigArgs, DevicesArgs, RecoverArgs, SignaturesArgs};
use crate::carve::signatures::SignatureCatalog;
use crate::carve::validate::Outcome;
use crate::config::{generate_sample_config, Config};
use crate::reader::devices::{list_devices, SourceDevice};
use crate::session::{RecoveryEvent, RecoveryReport, RecoverySession, SessionState};

/// Built-in signatures, the config's extra file and then `extra`
pub fn build_catalog(config: &Config, extra: Option<&Path>) -> Result<SignatureCatalog> {
    let mut catalog = config.catalog()?;
    if let Some(path) = extra {
        catalog.extend_from_file(path)?;
    }
    Ok(catalog)
}

/// Run a recovery and render its events until the worker stops.
///
/// Ctrl-C asks the session to cancel; files already written stay put and
/// the report is still produced.
pub async fn run_recover(args: &RecoverArgs, config: &Config) -> Result<RecoveryReport> {
    let catalog = build_catalog(config, args.signatures.as_deref())?;
    let options = args.recovery_options(config);

    if !args.json {
        output::print_header("deepscan recovery");
        output::print_kv("Source", &args.source.display().to_string());
        output::print_kv("Destination", &args.dest.display().to_string());
        output::print_kv(
            "Types",
            &options
                .file_types
                .as_ref()
                .map(|t| t.join(", "))
                .unwrap_or_else(|| "all".to_string()),
        );
        if options.scan.stride > 1 {
            output::print_kv("Stride", &format!("{} bytes", options.scan.stride));
        }
        println!();
    }

    let mut session = RecoverySession::new(Arc::new(catalog), options);
    let mut events = session
        .start(&args.source, &args.dest)
        .with_context(|| format!("Failed to start recovery of {}", args.source.display()))?;

    let bar = if args.json {
        ProgressBar::hidden()
    } else {
        output::scan_bar(0)?
    };

    let mut recovered = 0usize;
    let mut cancelling = false;
    let mut report = None;
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if args.json {
                    println!("{}", serde_json::to_string(&event)?);
                }
                match event {
                    RecoveryEvent::Progress { scanned_bytes, total_bytes, .. } => {
                        bar.set_length(total_bytes);
                        bar.set_position(scanned_bytes);
                    }
                    RecoveryEvent::FileRecovered { path, type_id, size, outcome } => {
                        recovered += 1;
                        bar.set_message(format!("{} files", recovered));
                        if outcome == Outcome::AcceptedWithWarnings {
                            bar.println(format!(
                                "{} {} {} ({}) has warnings, see report",
                                StatusIcons::WARNING.yellow(),
                                type_id,
                                path.display(),
                                humansize::format_size(size, humansize::BINARY)
                            ));
                        }
                    }
                    RecoveryEvent::Completed { report: done } => report = Some(*done),
                    RecoveryEvent::Failed { kind, message, offset } => {
                        failure = Some(match offset {
                            Some(at) => format!("{kind} at offset {at:#x}: {message}"),
                            None => format!("{kind}: {message}"),
                        });
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                bar.set_message("cancelling...");
                if let Err(e) = session.cancel() {
                    tracing::debug!(error = %e, "Cancel ignored");
                }
            }
        }
    }

    let state = tokio::task::spawn_blocking(move || session.wait()).await??;
    bar.finish_and_clear();

    if let Some(message) = failure {
        bail!("Recovery failed: {message}");
    }
    let Some(report) = report else {
        bail!("Recovery ended in state {state} without a report");
    };

    if !args.json {
        print!("{}", report.to_human_string());
        println!();
        output::print_type_gauge(&report.by_type);
        println!();
        match report.state {
            SessionState::Cancelled => output::print_warning(&format!(
                "Cancelled after {} - {} files recovered",
                humansize::format_size(report.bytes_scanned, humansize::BINARY),
                report.recovered
            )),
            _ => output::print_success(&format!(
                "Recovered {} files into {}",
                report.recovered,
                args.dest.display()
            )),
        }
    }

    Ok(report)
}

pub fn run_devices(args: &DevicesArgs) -> Result<()> {
    let devices = list_devices();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    print_devices(&devices);
    Ok(())
}

fn print_devices(devices: &[SourceDevice]) {
    output::print_header("Storage devices");
    if devices.is_empty() {
        output::print_warning("No devices found. Disk images can still be passed by path.");
        return;
    }
    println!(
        "  {:<22} {:<10} {:>10}  {}",
        "PATH".bold(),
        "KIND".bold(),
        "SIZE".bold(),
        "MODEL".bold()
    );
    for device in devices {
        let size = device
            .size
            .map(|s| humansize::format_size(s, humansize::BINARY))
            .unwrap_or_else(|| "?".to_string());
        let mut notes = device.model.clone().unwrap_or_default();
        if device.removable {
            notes.push_str(" (removable)");
        }
        println!(
            "  {:<22} {:<10} {:>10}  {}",
            device.path.display().to_string().bright_cyan(),
            device.kind.to_string(),
            size,
            notes.trim().bright_black()
        );
    }
    println!("\n  {} devices. Reading them usually needs root or administrator rights.", devices.len());
}

#[derive(Serialize)]
struct SignatureRow<'a> {
    id: &'a str,
    extension: &'a str,
    description: &'a str,
    header: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    max_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    structure: Option<&'static str>,
}

pub fn run_signatures(args: &SignaturesArgs, config: &Config) -> Result<()> {
    let catalog = build_catalog(config, args.signatures.as_deref())?;

    let rows: Vec<SignatureRow<'_>> = catalog
        .iter()
        .map(|sig| SignatureRow {
            id: &sig.id,
            extension: &sig.extension,
            description: &sig.description,
            header: hex::encode_upper(&sig.header),
            footer: sig.footer.as_ref().map(hex::encode_upper),
            max_size: sig.size_limit(),
            structure: sig.structure.map(|s| s.name()),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    output::print_header("Known signatures");
    println!(
        "  {:<8} {:<5} {:<18} {:<10} {:>10}  {}",
        "ID".bold(),
        "EXT".bold(),
        "HEADER".bold(),
        "FOOTER".bold(),
        "MAX".bold(),
        "CHECK".bold()
    );
    for row in &rows {
        println!(
            "  {:<8} {:<5} {:<18} {:<10} {:>10}  {}",
            row.id.bright_cyan(),
            row.extension,
            row.header,
            row.footer.as_deref().unwrap_or("-"),
            humansize::format_size(row.max_size, humansize::BINARY),
            row.structure.unwrap_or("footer").bright_black()
        );
    }
    println!("\n  {} signatures", rows.len());
    Ok(())
}

pub fn run_config(args: &ConfigArgs, config: &Config, path: &Path) -> Result<()> {
    match &args.action {
        ConfigAction::Show => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
        }
        ConfigAction::Init { force } => {
            if *force {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, generate_sample_config())
                    .with_context(|| format!("Failed to write config: {}", path.display()))?;
                output::print_success(&format!("Wrote {}", path.display()));
            } else if Config::ensure_exists(path)? {
                output::print_success(&format!("Created {}", path.display()));
            } else {
                output::print_warning(&format!(
                    "{} already exists (use --force to replace it)",
                    path.display()
                ));
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}
