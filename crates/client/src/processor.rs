//! Streaming batch processor.
//!
//! Submits one batch over a [`BatchTransport`], reads the response as an
//! event stream, and accumulates per-pointer results as they arrive. Each
//! run is one spawned task; its state is published through a `watch`
//! cell and notable changes are broadcast as [`BatchRunEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use plansight_core::error::{ErrorKind, PhaseError};
use plansight_core::files::{
    OriginalMetadata, PointerOutcome, PointerResult, ProtocolViolation,
};
use plansight_core::status::{CounterUpdate, PhaseState, ProcessingStatus};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::events::BatchRunEvent;
use crate::frame::{Frame, FrameDecoder};
use crate::messages::{parse_batch_event, BatchEvent, ProcessRequest};
use crate::transport::BatchTransport;

/// Broadcast channel capacity for run events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One recorded pointer outcome, with the sheet it was submitted under.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPointerResult {
    pub sheet_id: String,
    pub file_name: String,
    pub result: PointerResult,
}

/// Snapshot of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRunState {
    pub batch_id: String,
    pub phase: PhaseState,
    /// In submission order, at most one entry per pointer.
    pub results: Vec<RunPointerResult>,
    /// Records that referenced unknown pointers or were malformed.
    pub violations: Vec<ProtocolViolation>,
}

impl BatchRunState {
    fn new(batch_id: String, total: u64) -> Self {
        let mut phase = PhaseState::default();
        phase.start(Some(total));
        Self {
            batch_id,
            phase,
            results: Vec::new(),
            violations: Vec::new(),
        }
    }

    pub fn status(&self) -> ProcessingStatus {
        self.phase.status
    }

    pub fn is_processing(&self) -> bool {
        self.phase.is_processing()
    }

    pub fn error(&self) -> Option<&PhaseError> {
        self.phase.error.as_ref()
    }

    pub fn analyzed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.result.analysis().is_some())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.analyzed_count()
    }
}

/// Starts batch runs and fans their events out to subscribers.
///
/// Every run gets a child of the processor's cancellation token, so
/// [`BatchProcessor::shutdown`] stops all of them.
pub struct BatchProcessor {
    transport: Arc<dyn BatchTransport>,
    event_tx: broadcast::Sender<BatchRunEvent>,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(transport: Arc<dyn BatchTransport>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to events of every run started by this processor.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchRunEvent> {
        self.event_tx.subscribe()
    }

    /// Start processing `request` in a background task.
    pub fn process(&self, request: ProcessRequest) -> BatchRun {
        let mut expected = HashMap::new();
        let mut index = 0usize;
        for sheet in &request.sheets {
            for pointer in &sheet.pointers {
                expected.entry(pointer.id.clone()).or_insert_with(|| {
                    let entry = ExpectedPointer {
                        index,
                        sheet_id: sheet.sheet_id.clone(),
                        file_name: sheet.file_name.clone(),
                        metadata: pointer.original_metadata(),
                    };
                    index += 1;
                    entry
                });
            }
        }

        let batch_id = request.batch_id.clone();
        let (state_tx, state_rx) =
            watch::channel(BatchRunState::new(batch_id.clone(), expected.len() as u64));
        let cancel = self.cancel.child_token();

        let mut tracker = RunTracker {
            batch_id: batch_id.clone(),
            expected,
            state_tx,
            event_tx: self.event_tx.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let run_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(
                batch_id = %tracker.batch_id,
                pointers = tracker.expected.len(),
                "Starting batch run",
            );
            let outcome =
                stream_batch(transport.as_ref(), &request, &mut tracker, &run_cancel).await;
            tracker.finish(outcome);
        });

        BatchRun {
            batch_id,
            cancel,
            state: state_rx,
            handle,
        }
    }

    /// Cancel every run started by this processor.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down batch processor");
        self.cancel.cancel();
    }
}

/// Handle on one running batch.
pub struct BatchRun {
    batch_id: String,
    cancel: CancellationToken,
    state: watch::Receiver<BatchRunState>,
    handle: tokio::task::JoinHandle<()>,
}

impl BatchRun {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Stop reading the stream. Results received so far are kept and the
    /// run ends `idle` with a `Cancelled` error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> BatchRunState {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    pub fn watch(&self) -> watch::Receiver<BatchRunState> {
        self.state.clone()
    }

    /// Wait for the run to end and return its final state.
    pub async fn wait(self) -> BatchRunState {
        if let Err(e) = self.handle.await {
            tracing::error!(batch_id = %self.batch_id, error = %e, "Batch run task failed");
        }
        let state = self.state.borrow().clone();
        state
    }
}

// ---- run task ----

#[derive(Debug, Clone)]
struct ExpectedPointer {
    index: usize,
    sheet_id: String,
    file_name: String,
    metadata: OriginalMetadata,
}

enum RunOutcome {
    /// `batch_complete` received.
    Completed,
    /// The body ended without `batch_complete`.
    EndOfStream,
    Cancelled,
    Failed(PhaseError),
}

struct RunTracker {
    batch_id: String,
    expected: HashMap<String, ExpectedPointer>,
    state_tx: watch::Sender<BatchRunState>,
    event_tx: broadcast::Sender<BatchRunEvent>,
}

async fn stream_batch(
    transport: &dyn BatchTransport,
    request: &ProcessRequest,
    tracker: &mut RunTracker,
    cancel: &CancellationToken,
) -> RunOutcome {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return RunOutcome::Cancelled,
        opened = transport.open_batch_stream(request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return RunOutcome::Failed(PhaseError::new(e.kind(), e.to_string())),
    };

    let mut decoder = FrameDecoder::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.push(&chunk) {
                    if tracker.handle_frame(&frame) {
                        return RunOutcome::Completed;
                    }
                }
            }
            Some(Err(e)) => {
                return RunOutcome::Failed(PhaseError::new(ErrorKind::Network, e.to_string()));
            }
            None => {
                if let Some(frame) = decoder.finish() {
                    if tracker.handle_frame(&frame) {
                        return RunOutcome::Completed;
                    }
                }
                return RunOutcome::EndOfStream;
            }
        }
    }
}

impl RunTracker {
    /// Apply one frame. Returns `true` once the batch reported completion.
    fn handle_frame(&mut self, frame: &Frame) -> bool {
        let event = match parse_batch_event(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    batch_id = %self.batch_id,
                    event = %frame.name(),
                    error = %e,
                    "Malformed batch event, skipping",
                );
                return false;
            }
        };

        match event {
            BatchEvent::Start(data) => {
                let total = self.expected.len() as u64;
                if let Some(reported) = data.total_pointers {
                    if reported != total {
                        tracing::warn!(
                            batch_id = %self.batch_id,
                            reported,
                            submitted = total,
                            "Server pointer count differs from submission",
                        );
                    }
                }
                let _ = self.event_tx.send(BatchRunEvent::Started {
                    batch_id: self.batch_id.clone(),
                    total,
                });
                false
            }
            BatchEvent::PointerComplete(data) => {
                let data = *data;
                let pointer_id = data.pointer.id.clone();
                match PointerResult::try_from(data.pointer) {
                    Ok(result) => self.record(Some(&data.sheet_id), result),
                    Err(e) => self.violation(Some(data.sheet_id), pointer_id, e.to_string()),
                }
                false
            }
            BatchEvent::PointerError(data) => {
                match data.pointer_id {
                    Some(pointer_id) => {
                        let metadata = self
                            .expected
                            .get(&pointer_id)
                            .map(|e| e.metadata.clone())
                            .unwrap_or_default();
                        let result = PointerResult {
                            id: pointer_id,
                            original_metadata: metadata,
                            outcome: PointerOutcome::Error(data.error),
                        };
                        self.record(data.sheet_id.as_deref(), result);
                    }
                    None => {
                        tracing::warn!(
                            batch_id = %self.batch_id,
                            error = %data.error,
                            "Batch error without pointer id",
                        );
                    }
                }
                false
            }
            BatchEvent::Complete(data) => {
                tracing::debug!(
                    batch_id = %self.batch_id,
                    total_processed = ?data.total_processed,
                    "Batch complete event received",
                );
                true
            }
            BatchEvent::Unknown(name) => {
                tracing::debug!(batch_id = %self.batch_id, event = %name, "Ignoring unknown event");
                false
            }
        }
    }

    fn record(&mut self, sheet_id: Option<&str>, result: PointerResult) {
        let Some(expected) = self.expected.get(&result.id) else {
            self.violation(
                sheet_id.map(str::to_string),
                result.id,
                "result references a pointer that was not submitted".into(),
            );
            return;
        };
        if let Some(sheet_id) = sheet_id {
            if sheet_id != expected.sheet_id {
                tracing::warn!(
                    batch_id = %self.batch_id,
                    pointer_id = %result.id,
                    reported_sheet = %sheet_id,
                    submitted_sheet = %expected.sheet_id,
                    "Result reported under a different sheet",
                );
            }
        }

        let index = expected.index;
        let sheet_id = expected.sheet_id.clone();
        let event_sheet = sheet_id.clone();
        let file_name = expected.file_name.clone();
        let pointer_id = result.id.clone();
        let failure = result.error().map(str::to_string);
        let expected_map = &self.expected;
        let mut counts = None;

        self.state_tx.send_if_modified(|state| {
            if state.results.iter().any(|r| r.result.id == result.id) {
                return false;
            }
            let position = state.results.partition_point(|r| {
                expected_map
                    .get(&r.result.id)
                    .is_some_and(|e| e.index < index)
            });
            state.results.insert(
                position,
                RunPointerResult {
                    sheet_id,
                    file_name,
                    result,
                },
            );
            let done = state.results.len() as u64;
            let total = state.phase.total;
            state.phase.record_progress(done, total, CounterUpdate::Monotonic);
            counts = Some((state.phase.completed, state.phase.total));
            true
        });

        let Some((completed, total)) = counts else {
            tracing::debug!(
                batch_id = %self.batch_id,
                pointer_id = %pointer_id,
                "Duplicate result ignored",
            );
            return;
        };

        let event = match failure {
            None => BatchRunEvent::PointerCompleted {
                batch_id: self.batch_id.clone(),
                sheet_id: event_sheet,
                pointer_id,
                completed,
                total,
            },
            Some(error) => {
                tracing::warn!(
                    batch_id = %self.batch_id,
                    pointer_id = %pointer_id,
                    error = %error,
                    "Pointer analysis failed",
                );
                BatchRunEvent::PointerFailed {
                    batch_id: self.batch_id.clone(),
                    sheet_id: Some(event_sheet),
                    pointer_id,
                    error,
                }
            }
        };
        let _ = self.event_tx.send(event);
    }

    fn violation(&mut self, sheet_id: Option<String>, pointer_id: String, reason: String) {
        tracing::warn!(
            batch_id = %self.batch_id,
            pointer_id = %pointer_id,
            reason = %reason,
            "Protocol violation in batch stream",
        );
        self.state_tx.send_modify(|state| {
            state.violations.push(ProtocolViolation {
                sheet_id,
                pointer_id,
                reason,
            });
        });
    }

    fn finish(&mut self, outcome: RunOutcome) {
        let expected = self.expected.len();
        self.state_tx.send_modify(|state| {
            match outcome {
                RunOutcome::Completed => {
                    state.phase.complete();
                }
                RunOutcome::EndOfStream if state.results.len() >= expected => {
                    state.phase.complete();
                }
                RunOutcome::EndOfStream => {
                    state.phase.fail(PhaseError::new(
                        ErrorKind::IncompleteStream,
                        format!(
                            "stream ended after {} of {} pointers",
                            state.results.len(),
                            expected
                        ),
                    ));
                }
                RunOutcome::Cancelled => {
                    state.phase.fail(PhaseError::cancelled());
                }
                RunOutcome::Failed(error) => {
                    state.phase.fail(error);
                }
            }
        });

        let state = self.state_tx.borrow().clone();
        match &state.phase.error {
            None => tracing::info!(
                batch_id = %self.batch_id,
                results = state.results.len(),
                violations = state.violations.len(),
                "Batch run complete",
            ),
            Some(error) if error.is_cancelled() => {
                tracing::info!(batch_id = %self.batch_id, "Batch run cancelled")
            }
            Some(error) => tracing::warn!(
                batch_id = %self.batch_id,
                error = %error,
                results = state.results.len(),
                "Batch run ended with error",
            ),
        }

        let _ = self.event_tx.send(BatchRunEvent::Finished {
            batch_id: self.batch_id.clone(),
            status: state.phase.status,
            error: state.phase.error,
        });
    }
}
