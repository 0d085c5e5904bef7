//! deepscan Library
//!
//! Signature-based file carving - scans a raw disk image or block device
//! byte by byte for known file headers, validates every candidate and
//! copies the ones that hold up into a destination directory.
//!
//! # Features
//!
//! - **Lazy Scanning**: windowed reads with a first-byte index over the catalog
//! - **Structural Validation**: JPEG, PNG and GIF marker walks, ZIP central
//!   directory checks, declared sizes for BMP, RIFF and SQLite, PDF
//!   incremental updates
//! - **Read-Only Source**: the image is never opened for writing
//! - **Atomic Output**: files appear under their final name only when complete
//! - **Bad Block Handling**: unreadable blocks are skipped and reported
//! - **Device Listing**: disks, partitions and volumes to pick a source from
//!
//! # Example
//!
//! ```no_run
//! use deepscan::{start_recovery, RecoveryEvent, RecoveryOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut session, mut events) =
//!         start_recovery("disk.img", "recovered", RecoveryOptions::default())?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let RecoveryEvent::FileRecovered { path, .. } = &event {
//!             println!("recovered {}", path.display());
//!         }
//!     }
//!
//!     println!("finished: {}", session.wait()?);
//!     Ok(())
//! }
//! ```

pub mod carve;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod reader;
pub mod session;

// Re-export commonly used types
pub use carve::signatures::{Signature, SignatureCatalog, Structure};
pub use carve::validate::{validate, Confidence, Outcome, ValidatedExtent, ValidationError};
pub use carve::{scan, CancelToken, CandidateExtent, Rejection, ScanOptions, ScanStep, Scanner};
pub use config::Config;
pub use error::{CatalogError, ErrorKind, RecoveryError, Result};
pub use reader::{list_devices, BlockReader, BlockSource, SourceDevice};
pub use session::{
    cancel_recovery, start_recovery, EventStream, OverwritePolicy, RecoveryEvent,
    RecoveryOptions, RecoveryReport, RecoverySession, SessionState,
};
