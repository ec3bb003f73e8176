//! Phase status state machine.
//!
//! Each tracked phase moves `idle -> processing -> complete`. The only
//! way back from `processing` to `idle` is [`PhaseState::fail`], which
//! attaches the error. Every operation reports a [`Transition`] so that
//! callers sharing one status value can tell whether *they* caused a
//! change (e.g. completion must be observed exactly once).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, PhaseError};

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETE: &str = "complete";

/// Coarse status of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Idle,
    Processing,
    Complete,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => STATUS_IDLE,
            Self::Processing => STATUS_PROCESSING,
            Self::Complete => STATUS_COMPLETE,
        }
    }

    pub fn from_str_value(s: &str) -> Result<Self, CoreError> {
        match s {
            STATUS_IDLE => Ok(Self::Idle),
            STATUS_PROCESSING => Ok(Self::Processing),
            STATUS_COMPLETE => Ok(Self::Complete),
            other => Err(CoreError::Validation(format!(
                "Invalid processing status '{other}'. Must be one of: idle, processing, complete"
            ))),
        }
    }
}

/// Result of applying an operation to a [`PhaseState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Applied,
    /// The operation was legal but the state already reflected it.
    Unchanged,
    /// The operation is not legal from the current status.
    Rejected,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

/// How a counter update should be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// Never move counters backwards (push-channel events).
    Monotonic,
    /// Replace counters as-is (fresh authoritative poll).
    Authoritative,
}

/// Status, counters and last error of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: ProcessingStatus,
    pub completed: u64,
    pub total: u64,
    pub error: Option<PhaseError>,
}

impl PhaseState {
    pub fn is_processing(&self) -> bool {
        self.status == ProcessingStatus::Processing
    }

    /// Enter `processing`. Allowed from `idle` and from `complete`
    /// (a re-run); clears counters and any previous error.
    pub fn start(&mut self, total: Option<u64>) -> Transition {
        match self.status {
            ProcessingStatus::Processing => {
                if let Some(total) = total {
                    if total > self.total {
                        self.total = total;
                        return Transition::Applied;
                    }
                }
                Transition::Unchanged
            }
            ProcessingStatus::Idle | ProcessingStatus::Complete => {
                self.status = ProcessingStatus::Processing;
                self.completed = 0;
                self.total = total.unwrap_or(0);
                self.error = None;
                Transition::Applied
            }
        }
    }

    /// Merge a `(completed, total)` report.
    pub fn record_progress(&mut self, completed: u64, total: u64, mode: CounterUpdate) -> Transition {
        let (next_completed, next_total) = match mode {
            CounterUpdate::Monotonic => (self.completed.max(completed), self.total.max(total)),
            CounterUpdate::Authoritative => (completed, total),
        };
        if next_completed == self.completed && next_total == self.total {
            return Transition::Unchanged;
        }
        self.completed = next_completed;
        self.total = next_total;
        Transition::Applied
    }

    /// Leave `processing` successfully. Repeating it is a no-op.
    pub fn complete(&mut self) -> Transition {
        match self.status {
            ProcessingStatus::Processing => {
                self.status = ProcessingStatus::Complete;
                Transition::Applied
            }
            ProcessingStatus::Complete => Transition::Unchanged,
            ProcessingStatus::Idle => Transition::Rejected,
        }
    }

    /// Leave `processing` with an error attached.
    pub fn fail(&mut self, error: PhaseError) -> Transition {
        match self.status {
            ProcessingStatus::Processing => {
                self.status = ProcessingStatus::Idle;
                self.error = Some(error);
                Transition::Applied
            }
            ProcessingStatus::Idle | ProcessingStatus::Complete => Transition::Rejected,
        }
    }

    /// Completion percentage (0-100), `0` when the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed.min(self.total) as f64 / self.total as f64) * 100.0) as u8
    }
}
