//! Filesystem queue protocol between PlanSight and the external analysis
//! worker. See [`queue`] for the directory layout.

pub mod config;
pub mod error;
pub mod fsio;
pub mod queue;

pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::{
    BatchQueue, BatchState, CompletedBatch, CompletedListing, DiscardOutcome, ExportedBatch,
    ExportedPointer, MalformedBatch,
};
