//! Wizard - guided recovery for people who don't live in a terminal
//!
//! Walks through the same choices as `deepscan recover`:
//! - Which image or device to scan, picked from the detected devices or typed in
//! - Where recovered files should go
//! - Which file types to look for
//! - Minimum size and what to do with existing files
//!
//! then runs the recovery with a progress bar.

use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;
use console::Term;
use dialoguer::{theme::ColorfulTheme, Confirm, FuzzySelect, Input, MultiSelect};

use super::commands::{build_catalog, run_recover};
use super::{parse_size, RecoverArgs};
use crate::config::Config;
use crate::reader::devices::{list_devices, SourceDevice};
use crate::session::OverwritePolicy;

/// Default destination, relative to the working directory
const DEFAULT_DESTINATION: &str = "recovered_files";

pub async fn run_wizard(config: &Config) -> Result<()> {
    let term = Term::stdout();
    let _ = term.clear_screen();

    print_banner();

    let source = step_select_source()?;
    let dest = step_select_destination(&source)?;
    let types = step_select_types(config)?;
    let (min_size, overwrite) = step_options(config)?;

    // =========================================================================
    // Confirm
    // =========================================================================

    println!("\n{}", "Ready to scan:".bright_yellow().bold());
    println!("  Source:       {}", source.display().to_string().bright_white());
    println!("  Destination:  {}", dest.display().to_string().bright_white());
    println!(
        "  Types:        {}",
        types
            .as_ref()
            .map(|t| t.join(", "))
            .unwrap_or_else(|| "all".to_string())
            .bright_white()
    );
    println!(
        "  {}\n",
        "The source is only read, never modified. Press Ctrl-C to stop early.".bright_black()
    );

    if !Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Start recovery?")
        .default(true)
        .interact()?
    {
        println!("\n{}", "Nothing was scanned. Exiting.".yellow());
        return Ok(());
    }

    let args = RecoverArgs {
        source,
        dest,
        types,
        min_size: Some(min_size),
        overwrite: Some(overwrite),
        sector_aligned: false,
        stride: None,
        mmap: false,
        no_verify: false,
        signatures: None,
        json: false,
    };
    let report = run_recover(&args, config).await?;

    if report.recovered == 0 {
        println!(
            "\n{} {}",
            "ℹ".cyan(),
            "Nothing recoverable was found. Try `deepscan recover --types` with fewer types, or a raw device instead of a partition.".cyan()
        );
    }

    Ok(())
}

fn print_banner() {
    let banner = r#"
    ╔═══════════════════════════════════════════════════════════╗
    ║                                                           ║
    ║          D E E P S C A N                                  ║
    ║                                                           ║
    ║          guided file recovery                             ║
    ║                                                           ║
    ╚═══════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner.bright_cyan());
}

fn step_select_source() -> Result<PathBuf> {
    println!("{} What should be scanned?", "Step 1:".bright_yellow().bold());
    println!("  This could be:");
    println!("  • A disk image (.img, .dd, .raw)");
    #[cfg(unix)]
    println!("  • A block device such as /dev/sdb1 (may need sudo)");
    #[cfg(windows)]
    println!("  • A raw volume such as \\\\.\\E:");
    println!();

    let devices = list_devices();
    if !devices.is_empty() {
        let mut labels: Vec<String> = devices.iter().map(SourceDevice::label).collect();
        labels.push("Type a path (disk image or other device)".to_string());
        let selection = FuzzySelect::with_theme(&ColorfulTheme::default())
            .with_prompt("Pick a device")
            .items(&labels)
            .default(labels.len() - 1)
            .interact()?;
        if let Some(device) = devices.get(selection) {
            return Ok(device.path.clone());
        }
    }

    let path: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Image or device path")
        .validate_with(|input: &String| {
            let p = PathBuf::from(input.trim());
            if p.exists() {
                Ok(())
            } else {
                Err("Path does not exist")
            }
        })
        .interact_text()?;

    Ok(PathBuf::from(path.trim()))
}

fn step_select_destination(source: &Path) -> Result<PathBuf> {
    println!(
        "\n{} Where should recovered files go?",
        "Step 2:".bright_yellow().bold()
    );
    println!(
        "  {}\n",
        "Use a different drive than the one you are recovering from.".bright_black()
    );

    let source = source.to_path_buf();
    let dest: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Destination folder")
        .default(DEFAULT_DESTINATION.to_string())
        .validate_with(move |input: &String| {
            let p = PathBuf::from(input.trim());
            if p == source {
                Err("Destination can't be the source itself")
            } else if p.is_file() {
                Err("That's a file, pick a folder")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    Ok(PathBuf::from(dest.trim()))
}

/// `None` means every known type
fn step_select_types(config: &Config) -> Result<Option<Vec<String>>> {
    println!(
        "\n{} What kind of files are you looking for?",
        "Step 3:".bright_yellow().bold()
    );

    let catalog = build_catalog(config, None)?;
    let labels: Vec<String> = catalog
        .iter()
        .map(|sig| format!("{:<8} {}", sig.id, sig.description))
        .collect();
    let ids: Vec<String> = catalog.iter().map(|sig| sig.id.clone()).collect();

    let preselected: Vec<bool> = ids
        .iter()
        .map(|id| config.output.types.is_empty() || config.output.types.contains(id))
        .collect();

    let chosen = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Space to toggle, Enter to continue")
        .items(&labels)
        .defaults(&preselected)
        .interact()?;

    if chosen.is_empty() || chosen.len() == ids.len() {
        return Ok(None);
    }
    Ok(Some(chosen.into_iter().map(|i| ids[i].clone()).collect()))
}

fn step_options(config: &Config) -> Result<(u64, OverwritePolicy)> {
    println!("\n{} A couple of details", "Step 4:".bright_yellow().bold());

    let min: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Skip files smaller than (e.g. 0, 4KiB, 1MB)")
        .default(config.output.min_size.to_string())
        .validate_with(|input: &String| parse_size(input).map(|_| ()))
        .interact_text()?;
    let min_size = parse_size(&min).map_err(anyhow::Error::msg)?;

    let policies = [
        (OverwritePolicy::Rename, "Keep existing files, add a number to new ones"),
        (OverwritePolicy::Overwrite, "Replace files with the same name"),
        (OverwritePolicy::Refuse, "Stop unless the folder is empty"),
    ];
    let labels: Vec<&str> = policies.iter().map(|(_, label)| *label).collect();
    let default = policies
        .iter()
        .position(|(p, _)| *p == config.output.overwrite)
        .unwrap_or(0);

    let selection = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt("If the destination already has files")
        .items(&labels)
        .default(default)
        .interact()?;

    Ok((min_size, policies[selection].0))
}
