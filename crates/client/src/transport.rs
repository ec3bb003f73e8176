//! Transport seams between the processor/synchronizer and the network.
//!
//! [`crate::api::AnalysisApi`] implements both traits over HTTP; tests
//! substitute scripted in-memory transports.

use std::collections::BTreeMap;
use std::pin::Pin;

use futures::Stream;
use plansight_core::status::ProcessingStatus;

use crate::api::ApiError;
use crate::messages::ProcessRequest;

/// Raw response body chunks, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ApiError>> + Send>>;

/// Server-reported status of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSnapshot {
    pub status: ProcessingStatus,
    pub completed: u64,
    pub total: u64,
}

/// Result of one poll of the status endpoint, keyed by phase name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub phases: BTreeMap<String, PhaseSnapshot>,
}

impl StatusSnapshot {
    pub fn with_phase(mut self, name: impl Into<String>, phase: PhaseSnapshot) -> Self {
        self.phases.insert(name.into(), phase);
        self
    }
}

/// Opens the request/stream pair for interactive batch processing.
#[async_trait::async_trait]
pub trait BatchTransport: Send + Sync {
    async fn open_batch_stream(&self, request: &ProcessRequest) -> Result<ByteStream, ApiError>;
}

/// Push and pull channels for a long-running subject (e.g. a project).
#[async_trait::async_trait]
pub trait ProgressTransport: Send + Sync {
    /// `false` when the subject only has a status endpoint; the
    /// synchronizer then polls without opening a stream.
    fn has_progress_stream(&self) -> bool {
        true
    }

    /// Open the long-lived event stream.
    async fn open_progress_stream(&self, subject: &str) -> Result<ByteStream, ApiError>;

    /// Fetch the authoritative status once.
    async fn fetch_status(&self, subject: &str) -> Result<StatusSnapshot, ApiError>;
}
