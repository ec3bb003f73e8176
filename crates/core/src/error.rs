use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Classification of a failure attached to a phase or a batch run.
///
/// `Cancelled` is deliberately distinct from `Network` so that a display
/// layer can tell a user-initiated stop from a real failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Queue directory reads or writes.
    Io,
    /// Malformed manifest, results file or event frame.
    Parse,
    /// Connection-level failure.
    Network,
    /// User-initiated cancellation.
    Cancelled,
    /// A record that contradicts what was submitted.
    ProtocolViolation,
    /// The event stream ended before the batch reported completion.
    IncompleteStream,
    /// The server reported a failure for the phase.
    Remote,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Parse => "parse",
            Self::Network => "network",
            Self::Cancelled => "cancelled",
            Self::ProtocolViolation => "protocol_violation",
            Self::IncompleteStream => "incomplete_stream",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A clonable error value stored alongside a phase or run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PhaseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The marker stored when a caller cancels a run.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
