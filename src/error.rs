//! Error types shared by the reader, scanner and session.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kind as reported in events and the recovery report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    DestinationUnwritable,
    NoFooterFound,
    StructuralMismatch,
    IoFailure,
    InvalidState,
    Catalog,
    Worker,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SourceUnavailable => "source unavailable",
            ErrorKind::DestinationUnwritable => "destination unwritable",
            ErrorKind::NoFooterFound => "no footer found",
            ErrorKind::StructuralMismatch => "structural mismatch",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Catalog => "signature catalog",
            ErrorKind::Worker => "worker",
        };
        f.write_str(s)
    }
}

/// Errors raised while running a recovery
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("source unavailable: {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        offset: Option<u64>,
        #[source]
        source: io::Error,
    },

    #[error("destination unwritable: {path}: {source}")]
    DestinationUnwritable {
        path: PathBuf,
        offset: Option<u64>,
        #[source]
        source: io::Error,
    },

    #[error("read failed at offset {offset:#x}: {source}")]
    IoFailure {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("session is {state}, expected {expected}")]
    InvalidState {
        state: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("recovery worker failed: {0}")]
    Worker(String),
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            RecoveryError::DestinationUnwritable { .. } => ErrorKind::DestinationUnwritable,
            RecoveryError::IoFailure { .. } => ErrorKind::IoFailure,
            RecoveryError::InvalidState { .. } => ErrorKind::InvalidState,
            RecoveryError::Catalog(_) => ErrorKind::Catalog,
            RecoveryError::Worker(_) => ErrorKind::Worker,
        }
    }

    /// Source offset the error relates to, if any
    pub fn offset(&self) -> Option<u64> {
        match self {
            RecoveryError::SourceUnavailable { offset, .. }
            | RecoveryError::DestinationUnwritable { offset, .. } => *offset,
            RecoveryError::IoFailure { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Fatal errors end the session; everything else is per-candidate.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RecoveryError::IoFailure { .. })
    }

    pub(crate) fn destination(path: impl Into<PathBuf>, offset: Option<u64>, source: io::Error) -> Self {
        RecoveryError::DestinationUnwritable {
            path: path.into(),
            offset,
            source,
        }
    }
}

/// Errors raised while building or loading the signature catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate signature id '{0}'")]
    Duplicate(String),

    #[error("signature '{0}' has an empty header pattern")]
    EmptyHeader(String),

    #[error("signature '{0}' has neither a footer nor a structure validator")]
    Unbounded(String),

    #[error("unknown signature id '{0}'")]
    Unknown(String),

    #[error("signature '{id}': invalid hex pattern: {source}")]
    Hex {
        id: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("failed to read signature file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse signature file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = RecoveryError> = std::result::Result<T, E>;
