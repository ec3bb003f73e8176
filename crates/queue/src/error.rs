use std::path::PathBuf;

use plansight_core::error::{CoreError, ErrorKind};

/// Errors from the queue directory protocol.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A filesystem read or write failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The requested batch has no results (or no manifest) on disk.
    #[error("Batch not found: {0}")]
    NotFound(String),

    /// A JSON file exists but could not be parsed.
    #[error("Malformed file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A file parsed but contradicts the directory it lives in.
    #[error("Schema mismatch: {0}")]
    Schema(String),

    /// A manifest for this batch id is already present.
    #[error("Batch already exported: {0}")]
    AlreadyExported(String),

    /// The batch id was discarded and cannot be reused.
    #[error("Batch discarded: {0}")]
    Discarded(String),

    #[error(transparent)]
    Validation(#[from] CoreError),
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Coarse classification for status display.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::NotFound(_) => ErrorKind::Io,
            Self::Parse { .. } | Self::Schema(_) => ErrorKind::Parse,
            Self::AlreadyExported(_) | Self::Discarded(_) | Self::Validation(_) => {
                ErrorKind::ProtocolViolation
            }
        }
    }
}
