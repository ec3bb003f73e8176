//! Shared vocabulary for the PlanSight batch pipeline.
//!
//! Holds the submission and result data model, the on-disk file formats
//! exchanged with the external analysis worker, event-name constants, and
//! the phase/item status state machines used by both the streaming
//! processor and the progress synchronizer. This crate performs no I/O.

pub mod batch;
pub mod error;
pub mod event_names;
pub mod files;
pub mod items;
pub mod status;
pub mod types;
