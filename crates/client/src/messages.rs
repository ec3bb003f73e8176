//! Wire types for the analysis API.
//!
//! Event-stream frames carry their type in the `event:` field and a JSON
//! object in `data:`. [`parse_batch_event`] and [`parse_progress_event`]
//! turn a decoded [`Frame`] into a typed enum; names this client does not
//! know map to an `Unknown` variant instead of an error, so new server
//! events never break an older client.

use std::sync::LazyLock;

use base64::Engine;
use plansight_core::batch::{Batch, BoundingBox};
use plansight_core::event_names::{
    EVENT_BATCH_COMPLETE, EVENT_BATCH_START, EVENT_CONNECTED, EVENT_ERROR,
    EVENT_POINTER_COMPLETE, EVENT_PROCESSING_COMPLETE, EVENT_PROCESSING_ERROR,
    EVENT_PROCESSING_STARTED, ITEM_KIND_DISCIPLINE, ITEM_KIND_PAGE, PHASE_DISCIPLINES,
    PHASE_PAGES,
};
use plansight_core::files::{OriginalMetadata, PointerResultRecord};
use plansight_core::items::{derive_phase_status, ItemCounts};
use plansight_core::status::ProcessingStatus;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::Frame;
use crate::transport::{PhaseSnapshot, StatusSnapshot};

// ---------------------------------------------------------------------------
// Batch processing request
// ---------------------------------------------------------------------------

/// Body of `POST /api/ai/process-stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRequest {
    pub batch_id: String,
    pub sheets: Vec<ProcessSheet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSheet {
    pub sheet_id: String,
    pub file_name: String,
    pub pointers: Vec<ProcessPointer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessPointer {
    pub id: String,
    /// PNG/JPEG bytes, base64 without a `data:` prefix.
    pub image_base64: String,
    pub title: String,
    pub description: String,
    pub page_number: u32,
    pub source_file: String,
    pub bounding_box: Option<BoundingBox>,
}

impl ProcessRequest {
    pub fn from_batch(batch: &Batch) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        Self {
            batch_id: batch.id.clone(),
            sheets: batch
                .sheets
                .iter()
                .map(|sheet| ProcessSheet {
                    sheet_id: sheet.id.clone(),
                    file_name: sheet.file_name.clone(),
                    pointers: sheet
                        .pointers
                        .iter()
                        .map(|p| ProcessPointer {
                            id: p.id.clone(),
                            image_base64: engine.encode(&p.image),
                            title: p.title.clone(),
                            description: p.description.clone(),
                            page_number: p.page_number,
                            source_file: p.source_file.clone(),
                            bounding_box: p.bounding_box,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn pointer_count(&self) -> usize {
        self.sheets.iter().map(|s| s.pointers.len()).sum()
    }
}

impl ProcessPointer {
    /// Submitted metadata, as echoed back in results.
    pub fn original_metadata(&self) -> OriginalMetadata {
        OriginalMetadata {
            title: Some(self.title.clone()),
            description: Some(self.description.clone()),
            page_number: Some(self.page_number),
            bounding_box: self.bounding_box,
            source_file: Some(self.source_file.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch processing stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartData {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub total_pointers: Option<u64>,
    #[serde(default)]
    pub sheet_count: Option<u64>,
}

/// One analysed pointer. The server's `progress: {current, total}` is
/// not read; run counters come from the results actually accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerCompleteData {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub sheet_id: String,
    #[serde(default)]
    pub file_name: String,
    pub pointer: PointerResultRecord,
}

/// A pointer-scoped failure. Never fatal for the batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerErrorData {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub sheet_id: Option<String>,
    #[serde(default)]
    pub pointer_id: Option<String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompleteData {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub total_processed: Option<u64>,
    #[serde(default)]
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Start(BatchStartData),
    PointerComplete(Box<PointerCompleteData>),
    PointerError(PointerErrorData),
    Complete(BatchCompleteData),
    Unknown(String),
}

/// Empty `data:` is treated as `{}`.
fn payload<T: DeserializeOwned>(data: &str) -> Result<T, serde_json::Error> {
    if data.trim().is_empty() {
        serde_json::from_str("{}")
    } else {
        serde_json::from_str(data)
    }
}

/// Parse a batch-stream frame. `Err` only for a known event with a
/// malformed payload; callers log it and continue.
pub fn parse_batch_event(frame: &Frame) -> Result<BatchEvent, serde_json::Error> {
    match frame.name() {
        EVENT_BATCH_START => payload(&frame.data).map(BatchEvent::Start),
        EVENT_POINTER_COMPLETE => payload(&frame.data)
            .map(|data| BatchEvent::PointerComplete(Box::new(data))),
        EVENT_ERROR => payload(&frame.data).map(BatchEvent::PointerError),
        EVENT_BATCH_COMPLETE => payload(&frame.data).map(BatchEvent::Complete),
        other => Ok(BatchEvent::Unknown(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Project progress stream
// ---------------------------------------------------------------------------

static PASS_COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9]*)_pass(\d+)_complete$").expect("valid regex")
});
static PASS_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pass(\d+)_complete$").expect("valid regex"));
static ITEM_EVENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9]*)_(ready|processing|complete)$").expect("valid regex")
});
/// `pass1_total`, `pass2Completed`, ...: per-pass page counters.
static PASS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pass\d+(_|[A-Z])").expect("valid regex"));

/// Per-item fields pulled out of a `<kind>_*` event.
///
/// The server is not consistent about key style (`pageId`,
/// `discipline_code`, `disciplineCode`), so keys are looked up in both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub kind: String,
    pub item_id: Option<String>,
    /// Parent grouping reported with the item (a page's discipline).
    pub group: Option<String>,
    pub completed: Option<u64>,
    pub total: Option<u64>,
}

/// Which phase a phase-level event refers to.
///
/// `phase` is the explicit name. Without it, `kind` is the item kind the
/// payload's counters describe, if they describe one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseScope {
    pub phase: Option<String>,
    pub kind: Option<String>,
}

impl PhaseScope {
    pub fn named(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
            kind: None,
        }
    }

    fn from_payload(map: &Map<String, Value>) -> Self {
        Self {
            phase: string_field(map, "phase"),
            kind: kind_hint(map).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseStartedData {
    pub scope: PhaseScope,
    pub total: Option<u64>,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseErrorData {
    pub scope: PhaseScope,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Connected { subject: Option<String> },
    ProcessingStarted(PhaseStartedData),
    /// `<kind>_pass<N>_complete`
    PassComplete { pass: u32, update: ItemUpdate },
    /// `pass<N>_complete`: aggregate summary of one pass.
    PassSummary { pass: u32, completed: Option<u64>, errors: Option<u64> },
    ItemReady(ItemUpdate),
    ItemProcessing(ItemUpdate),
    ItemComplete(ItemUpdate),
    /// Item-scoped failure (`error`), not fatal for the phase.
    ItemError { item_id: Option<String>, pass: Option<u32>, error: String },
    ProcessingComplete(PhaseScope),
    ProcessingError(PhaseErrorData),
    Unknown(String),
}

fn to_camel(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Look a field up under its snake_case and camelCase names.
fn field<'a>(map: &'a Map<String, Value>, snake: &str) -> Option<&'a Value> {
    map.get(snake).or_else(|| map.get(&to_camel(snake)))
}

fn string_field(map: &Map<String, Value>, snake: &str) -> Option<String> {
    match field(map, snake)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn u64_field(map: &Map<String, Value>, snake: &str) -> Option<u64> {
    field(map, snake).and_then(Value::as_u64)
}

fn item_id(map: &Map<String, Value>, kind: &str) -> Option<String> {
    string_field(map, &format!("{kind}_id"))
        .or_else(|| string_field(map, &format!("{kind}_code")))
        .or_else(|| string_field(map, "id"))
}

/// Item kind named by a phase-level payload's keys: per-pass and page
/// counters belong to pages, `discipline*` keys to disciplines.
fn kind_hint(map: &Map<String, Value>) -> Option<&'static str> {
    map.keys().find_map(|key| {
        if PASS_KEY_RE.is_match(key)
            || key.starts_with(ITEM_KIND_PAGE)
            || key.starts_with("permanently")
        {
            Some(ITEM_KIND_PAGE)
        } else if key.starts_with(ITEM_KIND_DISCIPLINE) {
            Some(ITEM_KIND_DISCIPLINE)
        } else {
            None
        }
    })
}

fn item_update(kind: &str, map: &Map<String, Value>, pass: Option<u32>) -> ItemUpdate {
    let (completed, total) = match pass {
        Some(pass) => (
            u64_field(map, &format!("pass{pass}_progress")),
            u64_field(map, &format!("pass{pass}_total")),
        ),
        None => (u64_field(map, "progress"), u64_field(map, "total")),
    };
    ItemUpdate {
        kind: kind.to_string(),
        item_id: item_id(map, kind),
        group: string_field(map, "discipline"),
        completed,
        total,
    }
}

/// Parse a progress-stream frame. `Err` only when `data:` is not a JSON
/// object; unknown names are `Ok(Unknown)`.
pub fn parse_progress_event(frame: &Frame) -> Result<ProgressEvent, serde_json::Error> {
    let name = frame.name();
    let map: Map<String, Value> = payload(&frame.data)?;

    let event = match name {
        EVENT_CONNECTED => ProgressEvent::Connected {
            subject: string_field(&map, "project_id"),
        },
        EVENT_PROCESSING_STARTED => ProgressEvent::ProcessingStarted(PhaseStartedData {
            scope: PhaseScope::from_payload(&map),
            total: u64_field(&map, "total").or_else(|| u64_field(&map, "pass1_total")),
            job_id: string_field(&map, "job_id"),
        }),
        EVENT_PROCESSING_COMPLETE => {
            ProgressEvent::ProcessingComplete(PhaseScope::from_payload(&map))
        }
        EVENT_PROCESSING_ERROR => ProgressEvent::ProcessingError(PhaseErrorData {
            scope: PhaseScope::from_payload(&map),
            error: string_field(&map, "error").unwrap_or_default(),
        }),
        EVENT_ERROR => ProgressEvent::ItemError {
            item_id: string_field(&map, "page_id")
                .or_else(|| string_field(&map, "discipline_code"))
                .or_else(|| string_field(&map, "id")),
            pass: u64_field(&map, "pass").and_then(|p| u32::try_from(p).ok()),
            error: string_field(&map, "error").unwrap_or_default(),
        },
        _ => classify_pattern(name, &map),
    };
    Ok(event)
}

fn classify_pattern(name: &str, map: &Map<String, Value>) -> ProgressEvent {
    if let Some(caps) = PASS_SUMMARY_RE.captures(name) {
        if let Ok(pass) = caps[1].parse() {
            return ProgressEvent::PassSummary {
                pass,
                completed: u64_field(map, "completed"),
                errors: u64_field(map, "errors"),
            };
        }
    }
    if let Some(caps) = PASS_COMPLETE_RE.captures(name) {
        if let Ok(pass) = caps[2].parse() {
            return ProgressEvent::PassComplete {
                pass,
                update: item_update(&caps[1], map, Some(pass)),
            };
        }
    }
    if let Some(caps) = ITEM_EVENT_RE.captures(name) {
        let update = item_update(&caps[1], map, None);
        return match &caps[2] {
            "ready" => ProgressEvent::ItemReady(update),
            "processing" => ProgressEvent::ItemProcessing(update),
            _ => ProgressEvent::ItemComplete(update),
        };
    }
    ProgressEvent::Unknown(name.to_string())
}

// ---------------------------------------------------------------------------
// Status endpoints
// ---------------------------------------------------------------------------

/// `GET /projects/{id}/processing-status`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectStatusResponse {
    pub pages: PagesStatus,
    pub disciplines: DisciplinesStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PagesStatus {
    pub total: u64,
    #[serde(default)]
    pub unprocessed: u64,
    #[serde(default)]
    pub pass1_complete: u64,
    #[serde(default)]
    pub pass2_complete: u64,
    pub status: ProcessingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DisciplinesStatus {
    pub total: u64,
    #[serde(default)]
    pub waiting: u64,
    #[serde(default)]
    pub ready: u64,
    #[serde(default)]
    pub processing: u64,
    #[serde(default)]
    pub complete: u64,
    pub status: ProcessingStatus,
}

impl From<ProjectStatusResponse> for StatusSnapshot {
    fn from(response: ProjectStatusResponse) -> Self {
        let mut snapshot = StatusSnapshot::default();
        snapshot.phases.insert(
            PHASE_PAGES.to_string(),
            PhaseSnapshot {
                status: response.pages.status,
                completed: response.pages.pass2_complete,
                total: response.pages.total,
            },
        );
        snapshot.phases.insert(
            PHASE_DISCIPLINES.to_string(),
            PhaseSnapshot {
                status: response.disciplines.status,
                completed: response.disciplines.complete,
                total: response.disciplines.total,
            },
        );
        snapshot
    }
}

/// Flat counts for a single batch job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BatchStatusCounts {
    pub complete: u64,
    pub total: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub processing: u64,
    #[serde(default)]
    pub errors: u64,
}

impl BatchStatusCounts {
    /// Pointers that will not be worked on again, failed ones included.
    pub fn finished(&self) -> u64 {
        self.complete + self.errors
    }

    /// Per-pointer tally; pending pointers count as ready.
    pub fn item_counts(&self) -> ItemCounts {
        ItemCounts {
            total: self.total,
            waiting: 0,
            ready: self.pending,
            processing: self.processing,
            complete: self.finished().min(self.total),
        }
    }
}

impl From<BatchStatusCounts> for PhaseSnapshot {
    /// The batch job runs while any pointer is pending or processing.
    fn from(counts: BatchStatusCounts) -> Self {
        let job_running = counts.pending + counts.processing > 0;
        Self {
            status: derive_phase_status(&counts.item_counts(), job_running),
            completed: counts.finished(),
            total: counts.total,
        }
    }
}
