//! CLI module - Command line interface definitions and handlers

pub mod commands;
pub mod output;
pub mod wizard;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::session::{OverwritePolicy, RecoveryOptions};

/// deepscan - recover deleted files from raw disk images
///
/// Scans every byte of a disk image or block device for known file
/// signatures, validates each candidate and copies the survivors out.
/// The source is only ever opened for reading.
#[derive(Parser, Debug)]
#[command(name = "deepscan")]
#[command(author = "Ryan Cashmoney <tunclon@proton.me>")]
#[command(version)]
#[command(about = "Signature-based file carving for disk images", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbose output (debug logging)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Also write JSON logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Carve files out of a disk image or device
    Recover(RecoverArgs),

    /// List disks, partitions and volumes that can be scanned
    Devices(DevicesArgs),

    /// List the signatures the scanner knows about
    Signatures(SignaturesArgs),

    /// Show or create the config file
    Config(ConfigArgs),

    /// Guided recovery, one question at a time (default)
    Wizard,
}

#[derive(Args, Debug, Clone)]
pub struct RecoverArgs {
    /// Disk image, partition dump or block device
    pub source: PathBuf,

    /// Directory for recovered files and the report
    pub dest: PathBuf,

    /// Only carve these types (comma-separated ids, see `signatures`)
    #[arg(long, short = 't', value_delimiter = ',')]
    pub types: Option<Vec<String>>,

    /// Skip files smaller than this (e.g. 4096, 64KiB, 1MB)
    #[arg(long, value_parser = parse_size)]
    pub min_size: Option<u64>,

    /// What to do with files already in the destination
    #[arg(long, value_enum)]
    pub overwrite: Option<OverwritePolicy>,

    /// Only look for headers on 512-byte sector boundaries
    #[arg(long)]
    pub sector_aligned: bool,

    /// Header alignment in bytes (overrides --sector-aligned)
    #[arg(long, value_parser = parse_size)]
    pub stride: Option<u64>,

    /// Memory-map the source instead of positioned reads
    #[arg(long)]
    pub mmap: bool,

    /// Don't sniff recovered files for their real type
    #[arg(long)]
    pub no_verify: bool,

    /// Extra signatures (JSON: id -> header/footer hex)
    #[arg(long, value_name = "FILE")]
    pub signatures: Option<PathBuf>,

    /// Stream events as JSON lines instead of a progress bar
    #[arg(long)]
    pub json: bool,
}

impl RecoverArgs {
    /// Config values overridden by whatever was given on the command line
    pub fn recovery_options(&self, config: &Config) -> RecoveryOptions {
        let mut options = config.recovery_options();

        if let Some(types) = &self.types {
            options.file_types = Some(types.iter().map(|t| t.trim().to_ascii_lowercase()).collect());
        }
        if let Some(min) = self.min_size {
            options.min_size = min;
        }
        if let Some(policy) = self.overwrite {
            options.overwrite = policy;
        }
        if let Some(stride) = self.stride {
            options.scan.stride = stride.max(1);
        } else if self.sector_aligned {
            options.scan.stride = 512;
        }
        if self.mmap {
            options.use_mmap = true;
        }
        if self.no_verify {
            options.verify_types = false;
        }
        options
    }
}

#[derive(Args, Debug)]
pub struct DevicesArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SignaturesArgs {
    /// Include signatures from this JSON file
    #[arg(long, value_name = "FILE")]
    pub signatures: Option<PathBuf>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a commented sample config
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print where the config file lives
    Path,
}

/// Parse a byte size such as `4096`, `64KiB`, `64k` or `1MB`.
///
/// Bare `k`/`m`/`g` and the `-iB` forms are binary; `KB`/`MB`/`GB` are decimal.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size '{input}'"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{input}'"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => return Err(format!("unknown size unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{input}' is too large"))
}
