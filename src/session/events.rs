//! Events delivered to whoever drives a recovery session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::report::RecoveryReport;
use crate::carve::validate::Outcome;
use crate::error::ErrorKind;

/// Receiving half of a session's event channel.
///
/// Use `recv().await` from async code or `blocking_recv()` from a plain thread.
pub type EventStream = mpsc::UnboundedReceiver<RecoveryEvent>;

pub(crate) type EventSink = mpsc::UnboundedSender<RecoveryEvent>;

/// Session event. Serializes as `{"event": "progress", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecoveryEvent {
    /// Source bytes below `scanned_bytes` have been examined
    Progress {
        scanned_bytes: u64,
        total_bytes: u64,
        files_recovered: usize,
    },
    /// A file was written to the destination
    FileRecovered {
        path: PathBuf,
        #[serde(rename = "type")]
        type_id: String,
        size: u64,
        outcome: Outcome,
    },
    /// Terminal: scan finished or was cancelled
    Completed { report: Box<RecoveryReport> },
    /// Terminal: fatal error
    Failed {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
    },
}

impl RecoveryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryEvent::Completed { .. } | RecoveryEvent::Failed { .. }
        )
    }

    /// Scan progress as a percentage, for progress events
    pub fn percent(&self) -> Option<f64> {
        match self {
            RecoveryEvent::Progress {
                scanned_bytes,
                total_bytes,
                ..
            } => Some(if *total_bytes == 0 {
                100.0
            } else {
                *scanned_bytes as f64 * 100.0 / *total_bytes as f64
            }),
            _ => None,
        }
    }
}
