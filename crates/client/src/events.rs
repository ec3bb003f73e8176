//! Notifications broadcast by the batch processor and the progress
//! synchronizer.
//!
//! Subscribers receive these via `subscribe()`; the authoritative state
//! lives in the `watch` cells, so a lagging subscriber loses nothing it
//! cannot re-read.

use std::time::Duration;

use plansight_core::error::PhaseError;
use plansight_core::items::ItemStatus;
use plansight_core::status::ProcessingStatus;
use serde::Serialize;

/// Progress of one interactive batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BatchRunEvent {
    Started {
        batch_id: String,
        total: u64,
    },

    /// A pointer was analysed successfully.
    PointerCompleted {
        batch_id: String,
        sheet_id: String,
        pointer_id: String,
        completed: u64,
        total: u64,
    },

    /// A pointer failed; the batch continues.
    PointerFailed {
        batch_id: String,
        sheet_id: Option<String>,
        pointer_id: String,
        error: String,
    },

    /// The run reached its final state.
    Finished {
        batch_id: String,
        status: ProcessingStatus,
        error: Option<PhaseError>,
    },
}

/// Which channel observed a phase completion first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Push,
    Poll,
}

/// Changes observed by a progress synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    PhaseStarted {
        phase: String,
        total: u64,
    },
    PhaseProgress {
        phase: String,
        completed: u64,
        total: u64,
    },
    PhaseCompleted {
        phase: String,
        via: CompletionSource,
    },
    PhaseFailed {
        phase: String,
        error: PhaseError,
    },
    ItemChanged {
        kind: String,
        id: String,
        status: ItemStatus,
    },
    PushConnected,
    PushDisconnected,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// A status poll failed; polling continues.
    PollFailed {
        error: PhaseError,
    },
}
