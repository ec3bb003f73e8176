//! Event-stream event names shared by the batch and progress channels.

// -- Batch processing stream -------------------------------------------------

pub const EVENT_BATCH_START: &str = "batch_start";
pub const EVENT_POINTER_COMPLETE: &str = "pointer_complete";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_BATCH_COMPLETE: &str = "batch_complete";

// -- Project progress stream -------------------------------------------------

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_PROCESSING_STARTED: &str = "processing_started";
pub const EVENT_PROCESSING_COMPLETE: &str = "processing_complete";
pub const EVENT_PROCESSING_ERROR: &str = "processing_error";

// -- Phases and item kinds ---------------------------------------------------

pub const PHASE_PAGES: &str = "pages";
pub const PHASE_DISCIPLINES: &str = "disciplines";
/// Single phase of a queued batch followed through its status endpoint.
pub const PHASE_BATCH: &str = "batch";

pub const ITEM_KIND_PAGE: &str = "page";
pub const ITEM_KIND_DISCIPLINE: &str = "discipline";
pub const ITEM_KIND_POINTER: &str = "pointer";
