//! Recovery Session - drives scanner, validator and writer on a worker thread.
//!
//! ```text
//! Idle --start--> Scanning --+--> Completed
//!                            +--> Cancelled
//!                            +--> Failed
//! ```
//!
//! The caller talks to a running session only through its event stream and
//! [`RecoverySession::cancel`]; the worker is the only writer of session state.

pub mod events;
pub mod report;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::carve::signatures::SignatureCatalog;
use crate::carve::{self, Rejection, ScanOptions, ScanStep};
use crate::error::{RecoveryError, Result};
use crate::reader::{BlockReader, DEFAULT_RETRY_DELAY};
pub use crate::carve::CancelToken;
pub use events::{EventStream, RecoveryEvent};
use events::EventSink;
pub use report::{RecoveredFile, RecoveryReport};
use writer::OutputWriter;

pub const DEFAULT_REPORT_NAME: &str = "recovery_report.json";

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Scanning,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        })
    }
}

/// What to do when the destination already has files
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Keep existing files; add a numeric suffix on name collisions
    #[default]
    Rename,
    /// Replace existing files with the same name
    Overwrite,
    /// Fail unless the destination is empty
    Refuse,
}

/// Options for a recovery run
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Catalog ids to carve (None = all)
    pub file_types: Option<Vec<String>>,
    /// Skip recovered files smaller than this
    pub min_size: u64,
    pub overwrite: OverwritePolicy,
    pub scan: ScanOptions,
    /// Backoff before retrying a failed read
    pub retry_delay: Duration,
    /// Memory-map image files instead of positioned reads
    pub use_mmap: bool,
    /// Sniff written files with `infer`
    pub verify_types: bool,
    /// Report file name inside the destination
    pub report_name: String,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            file_types: None,
            min_size: 0,
            overwrite: OverwritePolicy::Rename,
            scan: ScanOptions::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            use_mmap: false,
            verify_types: true,
            report_name: DEFAULT_REPORT_NAME.to_string(),
        }
    }
}

enum Source {
    Path(PathBuf),
    Reader(BlockReader),
}

/// One recovery run against one source
pub struct RecoverySession {
    id: Uuid,
    catalog: Arc<SignatureCatalog>,
    options: RecoveryOptions,
    state: Arc<RwLock<SessionState>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl RecoverySession {
    pub fn new(catalog: Arc<SignatureCatalog>, options: RecoveryOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            catalog,
            options,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            cancel: CancelToken::new(),
            worker: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Open `source` on the worker thread and recover into `destination`
    pub fn start(
        &mut self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<EventStream> {
        self.launch(
            Source::Path(source.as_ref().to_path_buf()),
            destination.as_ref(),
        )
    }

    /// Recover from an already-open reader
    pub fn start_with_reader(
        &mut self,
        reader: BlockReader,
        destination: impl AsRef<Path>,
    ) -> Result<EventStream> {
        self.launch(Source::Reader(reader), destination.as_ref())
    }

    fn launch(&mut self, source: Source, destination: &Path) -> Result<EventStream> {
        {
            let state = self.state.read();
            if *state != SessionState::Idle {
                return Err(RecoveryError::InvalidState {
                    state: state.to_string(),
                    expected: "idle",
                });
            }
        }

        let catalog = match &self.options.file_types {
            Some(ids) => Arc::new(self.catalog.filtered(ids.as_slice())?),
            None => Arc::clone(&self.catalog),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            id: self.id,
            catalog,
            options: self.options.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            tx,
            destination: destination.to_path_buf(),
        };

        *self.state.write() = SessionState::Scanning;
        let handle = std::thread::Builder::new()
            .name(format!("deepscan-{}", &self.id.simple().to_string()[..8]))
            .spawn(move || worker.run(source))
            .map_err(|e| {
                *self.state.write() = SessionState::Failed;
                RecoveryError::Worker(e.to_string())
            })?;
        self.worker = Some(handle);
        Ok(rx)
    }

    /// Ask the worker to stop at the next extent boundary
    pub fn cancel(&self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Scanning {
            return Err(RecoveryError::InvalidState {
                state: state.to_string(),
                expected: "scanning",
            });
        }
        tracing::info!(session = %self.id, "Cancellation requested");
        self.cancel.cancel();
        Ok(())
    }

    /// Block until the worker exits and return the final state
    pub fn wait(&mut self) -> Result<SessionState> {
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| RecoveryError::Worker("worker thread panicked".to_string()))?;
        }
        Ok(self.state())
    }
}

/// Start a recovery with the built-in catalog
pub fn start_recovery(
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    options: RecoveryOptions,
) -> Result<(RecoverySession, EventStream)> {
    let mut session = RecoverySession::new(Arc::new(SignatureCatalog::builtin()), options);
    let events = session.start(source, destination)?;
    Ok((session, events))
}

pub fn cancel_recovery(session: &RecoverySession) -> Result<()> {
    session.cancel()
}

/// Everything the worker thread owns
struct Worker {
    id: Uuid,
    catalog: Arc<SignatureCatalog>,
    options: RecoveryOptions,
    state: Arc<RwLock<SessionState>>,
    cancel: CancelToken,
    tx: EventSink,
    destination: PathBuf,
}

impl Worker {
    fn run(self, source: Source) {
        let source_path = match &source {
            Source::Path(p) => p.clone(),
            Source::Reader(r) => r.path().to_path_buf(),
        };
        let mut report = RecoveryReport::new(self.id, &source_path, &self.destination);
        let clock = Instant::now();

        tracing::info!(
            session = %self.id,
            source = %source_path.display(),
            destination = %self.destination.display(),
            types = self.catalog.len(),
            "Recovery started"
        );

        let reader = match source {
            Source::Path(path) => {
                let opened = if self.options.use_mmap {
                    BlockReader::open_mmap(&path)
                } else {
                    BlockReader::open(&path)
                };
                match opened {
                    Ok(r) => r.with_retry_delay(self.options.retry_delay),
                    Err(e) => return self.fail(report, e, 0),
                }
            }
            Source::Reader(r) => r,
        };
        report.total_bytes = reader.size();

        let mut writer = match OutputWriter::prepare(
            &self.destination,
            self.options.overwrite,
            self.options.verify_types,
        ) {
            Ok(w) => w,
            Err(e) => return self.fail(report, e, 0),
        };

        let mut progress = ProgressTracker {
            last: 0,
            total: reader.size(),
        };
        let mut fatal = None;

        let mut scanner = carve::scan(&reader, &self.catalog, &self.options.scan, self.cancel.clone());
        for step in scanner.by_ref() {
            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            match step {
                ScanStep::Progress { offset } => progress.emit(&self.tx, offset, report.recovered),
                ScanStep::Rejected(rejection) => report.record_rejection(rejection),
                ScanStep::Candidate(found) => {
                    let extent = &found.extent;
                    if extent.len() < self.options.min_size {
                        tracing::debug!(offset = extent.start, size = extent.len(), "Below minimum size");
                        report.skipped_small += 1;
                        continue;
                    }
                    match writer.write(&reader, &found) {
                        Ok(written) => {
                            tracing::debug!(
                                offset = extent.start,
                                type_id = %extent.type_id,
                                size = written.size,
                                path = %written.path.display(),
                                "Recovered file"
                            );
                            let _ = self.tx.send(RecoveryEvent::FileRecovered {
                                path: written.path.clone(),
                                type_id: extent.type_id.clone(),
                                size: written.size,
                                outcome: found.outcome,
                            });
                            report.record_file(RecoveredFile {
                                type_id: extent.type_id.clone(),
                                extension: found.extension.clone(),
                                source_start: extent.start,
                                source_end: extent.end,
                                path: written.path,
                                size: written.size,
                                outcome: found.outcome,
                                confidence: extent.confidence,
                                warnings: found.warnings.clone(),
                                blake3: written.blake3,
                                detected_type: written.detected_type,
                            });
                            progress.emit(&self.tx, extent.end, report.recovered);
                        }
                        Err(e) if e.is_fatal() => {
                            fatal = Some(e);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(offset = extent.start, error = %e, "Failed to copy candidate");
                            report.record_rejection(Rejection {
                                type_id: Some(extent.type_id.clone()),
                                offset: extent.start,
                                kind: e.kind(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let cancelled = scanner.was_cancelled();
        let reached = scanner.offset();
        drop(scanner);

        if let Some(e) = fatal {
            return self.fail(report, e, reached);
        }

        let state = if cancelled {
            SessionState::Cancelled
        } else {
            SessionState::Completed
        };
        progress.emit(&self.tx, reached, report.recovered);
        report.finish(state, reached, None);

        let report_path = writer.dir().join(&self.options.report_name);
        if let Err(e) = report.write(&report_path) {
            return self.fail(report, e, reached);
        }

        *self.state.write() = state;
        tracing::info!(
            session = %self.id,
            state = %state,
            recovered = report.recovered,
            rejected = report.rejected,
            elapsed = %humantime::format_duration(Duration::from_millis(clock.elapsed().as_millis() as u64)),
            "Recovery finished"
        );
        let _ = self.tx.send(RecoveryEvent::Completed {
            report: Box::new(report),
        });
    }

    fn fail(&self, mut report: RecoveryReport, error: RecoveryError, reached: u64) {
        tracing::error!(session = %self.id, error = %error, offset = ?error.offset(), "Recovery failed");
        report.finish(SessionState::Failed, reached, Some(&error));

        // Best effort: the destination may be exactly what broke
        if !matches!(error, RecoveryError::DestinationUnwritable { .. }) {
            let path = self.destination.join(&self.options.report_name);
            if let Err(e) = report.write(&path) {
                tracing::warn!(error = %e, "Could not write report for failed session");
            }
        }

        *self.state.write() = SessionState::Failed;
        let _ = self.tx.send(RecoveryEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
            offset: error.offset(),
        });
    }
}

/// Emits progress only when the offset moves forward
struct ProgressTracker {
    last: u64,
    total: u64,
}

impl ProgressTracker {
    fn emit(&mut self, tx: &EventSink, offset: u64, files_recovered: usize) {
        if offset <= self.last {
            return;
        }
        self.last = offset;
        let _ = tx.send(RecoveryEvent::Progress {
            scanned_bytes: offset,
            total_bytes: self.total,
            files_recovered,
        });
    }
}
