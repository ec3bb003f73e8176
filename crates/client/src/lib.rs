//! Analysis API client library.
//!
//! Provides the event-stream frame decoder, typed stream events, the
//! HTTP transport, the streaming batch processor for interactive
//! submissions, and the dual-channel progress synchronizer for
//! long-running server-side processing.

pub mod api;
pub mod events;
pub mod frame;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod store;
pub mod synchronizer;
pub mod transport;
