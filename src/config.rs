//! Configuration Module - user preferences from config.toml
//!
//! Supports:
//! - Logging level and optional JSON log file
//! - Scan window, stride and read retry tuning
//! - Output policy, minimum size and default type filter
//! - An extra JSON signature file

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::carve::signatures::SignatureCatalog;
use crate::carve::{ScanOptions, DEFAULT_WINDOW_SIZE};
use crate::error::CatalogError;
use crate::session::{OverwritePolicy, RecoveryOptions, DEFAULT_REPORT_NAME};

/// deepscan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub scan: ScanConfig,
    pub output: OutputConfig,
    pub signatures: SignaturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
    /// Also write JSON logs here
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Bytes read per scanner window
    pub window_size: usize,
    /// Only examine 512-byte sector boundaries
    pub sector_aligned: bool,
    /// Explicit stride; overrides sector_aligned when > 1
    pub stride: u64,
    /// Backoff before retrying a failed read (ms)
    pub io_retry_delay_ms: u64,
    /// Memory-map image files
    pub use_mmap: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            sector_aligned: false,
            stride: 1,
            io_retry_delay_ms: 50,
            use_mmap: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Skip recovered files smaller than this many bytes
    pub min_size: u64,
    pub overwrite: OverwritePolicy,
    pub report_name: String,
    /// Sniff recovered files and record the detected type
    pub verify_types: bool,
    /// Default type filter (empty = all)
    pub types: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            overwrite: OverwritePolicy::Rename,
            report_name: DEFAULT_REPORT_NAME.to_string(),
            verify_types: true,
            types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignaturesConfig {
    /// JSON file of extra signatures (id -> header/footer hex)
    pub extra_file: Option<PathBuf>,
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "tunclon", "deepscan")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".deepscan")
                    .join("config.toml")
            })
    }

    /// Write the commented sample config if none exists yet
    pub fn ensure_exists(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, generate_sample_config())
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        tracing::info!("Created default config at {}", path.display());
        Ok(true)
    }

    pub fn scan_options(&self) -> ScanOptions {
        let stride = if self.scan.stride > 1 {
            self.scan.stride
        } else if self.scan.sector_aligned {
            512
        } else {
            1
        };
        ScanOptions {
            start_offset: 0,
            stride,
            window_size: self.scan.window_size,
        }
    }

    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            file_types: if self.output.types.is_empty() {
                None
            } else {
                Some(self.output.types.clone())
            },
            min_size: self.output.min_size,
            overwrite: self.output.overwrite,
            scan: self.scan_options(),
            retry_delay: Duration::from_millis(self.scan.io_retry_delay_ms),
            use_mmap: self.scan.use_mmap,
            verify_types: self.output.verify_types,
            report_name: self.output.report_name.clone(),
        }
    }

    /// Built-in catalog plus the configured extra signature file
    pub fn catalog(&self) -> std::result::Result<SignatureCatalog, CatalogError> {
        let mut catalog = SignatureCatalog::builtin();
        if let Some(path) = &self.signatures.extra_file {
            catalog.extend_from_file(path)?;
        }
        Ok(catalog)
    }
}

/// Generate a sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# deepscan configuration
# Location: ~/.config/deepscan/config.toml (or %APPDATA%\tunclon\deepscan\config on Windows)

[general]
# Log level: trace, debug, info, warn, error
log_level = "info"

# Also write JSON logs to this file (optional)
# log_file = "/var/log/deepscan.log"

[scan]
# Bytes read per scanner window
window_size = 1048576

# Only look for headers on 512-byte sector boundaries
sector_aligned = false

# Explicit stride in bytes (overrides sector_aligned when > 1)
stride = 1

# Wait before retrying a failed read once (milliseconds)
io_retry_delay_ms = 50

# Memory-map image files instead of positioned reads
use_mmap = false

[output]
# Skip recovered files smaller than this many bytes
min_size = 0

# Existing files in the destination: "rename", "overwrite" or "refuse"
overwrite = "rename"

# Summary report written next to the recovered files
report_name = "recovery_report.json"

# Detect the real type of each recovered file
verify_types = true

# Only carve these types (empty = all). See `deepscan signatures`.
# Example: ["jpeg", "png", "zip"]
types = []

[signatures]
# Extra signatures as JSON: { "mp3": { "header": "494433", "footer": null } }
# extra_file = "/home/user/sign.json"
"#
    .to_string()
}
