//! Machine-readable summary written next to the recovered files.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SessionState;
use crate::carve::validate::{Confidence, Outcome};
use crate::carve::Rejection;
use crate::error::{ErrorKind, RecoveryError, Result};

pub const REPORT_VERSION: u32 = 1;

/// Detailed rejections kept in the report; the count is always exact
pub const MAX_REJECTION_DETAILS: usize = 1000;

/// One file written to the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredFile {
    #[serde(rename = "type")]
    pub type_id: String,
    pub extension: String,
    /// Extent in the source
    pub source_start: u64,
    pub source_end: u64,
    pub path: PathBuf,
    pub size: u64,
    pub outcome: Outcome,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Blake3 of the written bytes
    pub blake3: String,
    /// Type sniffed from content, when verification is on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    pub recovered: usize,
    pub rejected: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Who ran the recovery and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// username@hostname
    pub operator: String,
    pub machine: String,
    pub os: String,
}

impl HostInfo {
    pub fn from_environment() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            operator: format!("{}@{}", whoami::username(), hostname),
            machine: format!("{} ({} CPUs)", hostname, num_cpus::get()),
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Summary of a recovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub version: u32,
    pub tool: String,
    pub tool_version: String,
    pub session_id: Uuid,
    pub state: SessionState,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub total_bytes: u64,
    pub bytes_scanned: u64,
    pub recovered: usize,
    pub rejected: usize,
    pub with_warnings: usize,
    pub skipped_small: usize,
    pub bytes_recovered: u64,
    pub by_type: BTreeMap<String, TypeCount>,
    pub files: Vec<RecoveredFile>,
    pub rejections: Vec<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
    pub host: HostInfo,
}

impl RecoveryReport {
    pub fn new(session_id: Uuid, source: &Path, destination: &Path) -> Self {
        Self {
            version: REPORT_VERSION,
            tool: env!("CARGO_PKG_NAME").to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            session_id,
            state: SessionState::Scanning,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
            total_bytes: 0,
            bytes_scanned: 0,
            recovered: 0,
            rejected: 0,
            with_warnings: 0,
            skipped_small: 0,
            bytes_recovered: 0,
            by_type: BTreeMap::new(),
            files: Vec::new(),
            rejections: Vec::new(),
            error: None,
            host: HostInfo::from_environment(),
        }
    }

    pub fn record_file(&mut self, file: RecoveredFile) {
        self.recovered += 1;
        self.bytes_recovered += file.size;
        if file.outcome == Outcome::AcceptedWithWarnings {
            self.with_warnings += 1;
        }
        let entry = self.by_type.entry(file.type_id.clone()).or_default();
        entry.recovered += 1;
        entry.bytes += file.size;
        self.files.push(file);
    }

    pub fn record_rejection(&mut self, rejection: Rejection) {
        self.rejected += 1;
        if let Some(id) = &rejection.type_id {
            self.by_type.entry(id.clone()).or_default().rejected += 1;
        }
        if self.rejections.len() < MAX_REJECTION_DETAILS {
            self.rejections.push(rejection);
        }
    }

    pub fn finish(&mut self, state: SessionState, bytes_scanned: u64, error: Option<&RecoveryError>) {
        let now = Utc::now();
        self.state = state;
        self.bytes_scanned = bytes_scanned;
        self.finished_at = Some(now);
        self.elapsed_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.error = error.map(|e| ReportError {
            kind: e.kind(),
            message: e.to_string(),
            offset: e.offset(),
        });
    }

    /// Write as pretty JSON, via a temp file so a crash never leaves half a report
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let fail = |e: std::io::Error| RecoveryError::destination(path, None, e);

        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| fail(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let mut file = std::fs::File::create(&tmp).map_err(fail)?;
        file.write_all(&json).map_err(fail)?;
        file.sync_all().map_err(fail)?;
        drop(file);
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            fail(e)
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report: {}", path.display()))
    }

    /// Generate a human-readable summary
    pub fn to_human_string(&self) -> String {
        let mut out = String::new();
        let elapsed = std::time::Duration::from_millis(self.elapsed_ms);

        out.push_str("\n  Recovery Report\n");
        out.push_str("  ========================================\n\n");
        out.push_str(&format!("  Session:         {}\n", self.session_id));
        out.push_str(&format!("  State:           {}\n", self.state));
        out.push_str(&format!("  Source:          {}\n", self.source.display()));
        out.push_str(&format!("  Destination:     {}\n", self.destination.display()));
        out.push_str(&format!(
            "  Started:         {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!(
            "  Elapsed:         {}\n",
            humantime::format_duration(elapsed)
        ));
        out.push_str(&format!(
            "  Scanned:         {} of {}\n",
            humansize::format_size(self.bytes_scanned, humansize::BINARY),
            humansize::format_size(self.total_bytes, humansize::BINARY)
        ));
        out.push_str(&format!(
            "  Recovered:       {} files ({})\n",
            self.recovered,
            humansize::format_size(self.bytes_recovered, humansize::BINARY)
        ));
        if self.with_warnings > 0 {
            out.push_str(&format!("  With warnings:   {}\n", self.with_warnings));
        }
        out.push_str(&format!("  Rejected:        {}\n", self.rejected));
        if self.skipped_small > 0 {
            out.push_str(&format!("  Too small:       {}\n", self.skipped_small));
        }

        if !self.by_type.is_empty() {
            out.push_str("\n  By type:\n");
            for (id, count) in &self.by_type {
                out.push_str(&format!(
                    "    {:<10} {:>6} recovered {:>6} rejected  {}\n",
                    id,
                    count.recovered,
                    count.rejected,
                    humansize::format_size(count.bytes, humansize::BINARY)
                ));
            }
        }

        if let Some(err) = &self.error {
            out.push_str(&format!("\n  Error ({}): {}\n", err.kind, err.message));
        }

        out
    }
}
