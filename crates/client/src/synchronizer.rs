//! Dual-channel progress synchronizer.
//!
//! While any tracked phase is `processing`, two background loops keep the
//! shared [`StatusStore`] current:
//!
//! - the **push** loop holds the server's progress event stream open and
//!   reconnects with exponential backoff when it drops;
//! - the **poll** loop fetches the authoritative status at a fixed
//!   interval, so a silent stream can never stall the UI.
//!
//! Both loops exit once no phase is `processing` any more. A phase
//! completes exactly once, through whichever channel saw it first.
//! Subjects without an event stream (queued batches) are polled only.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use plansight_core::error::{ErrorKind, PhaseError};
use plansight_core::event_names::{
    ITEM_KIND_DISCIPLINE, ITEM_KIND_PAGE, ITEM_KIND_POINTER, PHASE_BATCH, PHASE_DISCIPLINES,
    PHASE_PAGES,
};
use plansight_core::items::{ItemKey, ItemStatus};
use plansight_core::status::{CounterUpdate, ProcessingStatus, Transition};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{AnalysisApi, ApiError, BatchStatusPoller, DEFAULT_API_URL};
use crate::events::{CompletionSource, SyncEvent};
use crate::frame::{Frame, FrameDecoder};
use crate::messages::{parse_progress_event, ItemUpdate, PhaseScope, ProgressEvent};
use crate::reconnect::{Backoff, ReconnectConfig};
use crate::store::{StatusStore, SyncStatus};
use crate::transport::{ByteStream, ProgressTransport, StatusSnapshot};

/// Broadcast channel capacity for sync events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One tracked phase and the item kind its events refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: String,
    pub item_kind: String,
    /// Number of passes an item goes through; the last one completes it.
    pub passes: u32,
    /// Phase whose items gate this phase's items.
    pub depends_on: Option<String>,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, item_kind: impl Into<String>, passes: u32) -> Self {
        Self {
            name: name.into(),
            item_kind: item_kind.into(),
            passes: passes.max(1),
            depends_on: None,
        }
    }

    pub fn depends_on(mut self, phase: impl Into<String>) -> Self {
        self.depends_on = Some(phase.into());
        self
    }

    /// Page processing: two passes per page.
    pub fn pages() -> Self {
        Self::new(PHASE_PAGES, ITEM_KIND_PAGE, 2)
    }

    /// Discipline processing: gated on the pages of each discipline.
    pub fn disciplines() -> Self {
        Self::new(PHASE_DISCIPLINES, ITEM_KIND_DISCIPLINE, 1).depends_on(PHASE_PAGES)
    }

    /// A queued batch: one pass per pointer.
    pub fn batch() -> Self {
        Self::new(PHASE_BATCH, ITEM_KIND_POINTER, 1)
    }

    pub fn defaults() -> Vec<Self> {
        vec![Self::pages(), Self::disciplines()]
    }
}

/// Synchronizer settings.
///
/// | Env var                  | Default                 |
/// |--------------------------|-------------------------|
/// | `ANALYSIS_API_URL`       | `http://localhost:8000` |
/// | `SYNC_POLL_INTERVAL_MS`  | `3000`                  |
/// | `SYNC_RECONNECT_MIN_MS`  | `1000`                  |
/// | `SYNC_RECONNECT_MAX_MS`  | `30000`                 |
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub poll_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from environment variables. Invalid values fall back to the
    /// defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("ANALYSIS_API_URL").unwrap_or(defaults.api_url),
            poll_interval: env_millis("SYNC_POLL_INTERVAL_MS", defaults.poll_interval),
            reconnect: ReconnectConfig {
                min_delay: env_millis("SYNC_RECONNECT_MIN_MS", defaults.reconnect.min_delay),
                max_delay: env_millis("SYNC_RECONNECT_MAX_MS", defaults.reconnect.max_delay),
                ..defaults.reconnect
            },
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => parse_millis(&raw).unwrap_or_else(|| {
            tracing::warn!(var = name, value = %raw, "Invalid duration, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Positive whole milliseconds.
fn parse_millis(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Keeps the progress of one subject (e.g. a project) in sync with the
/// analysis server.
///
/// Cloning is cheap; clones share state and background tasks.
#[derive(Clone)]
pub struct ProgressSynchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    subject: String,
    phases: Vec<PhaseSpec>,
    transport: Arc<dyn ProgressTransport>,
    config: SyncConfig,
    store: StatusStore,
    event_tx: broadcast::Sender<SyncEvent>,
    /// Master token -- cancelled during shutdown.
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ProgressSynchronizer {
    /// Track the default `pages` and `disciplines` phases.
    pub fn new(
        subject: impl Into<String>,
        transport: Arc<dyn ProgressTransport>,
        config: SyncConfig,
    ) -> Self {
        Self::with_phases(subject, transport, config, PhaseSpec::defaults())
    }

    pub fn with_phases(
        subject: impl Into<String>,
        transport: Arc<dyn ProgressTransport>,
        config: SyncConfig,
        phases: Vec<PhaseSpec>,
    ) -> Self {
        let subject = subject.into();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = StatusStore::new(subject.clone(), phases.iter().map(|p| p.name.clone()));
        Self {
            inner: Arc::new(Inner {
                subject,
                phases,
                transport,
                config,
                store,
                event_tx,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Follow one queued batch through its status endpoint.
    pub fn for_batch(batch_id: impl Into<String>, api: AnalysisApi, config: SyncConfig) -> Self {
        Self::with_phases(
            batch_id,
            Arc::new(BatchStatusPoller::new(api)),
            config,
            vec![PhaseSpec::batch()],
        )
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.inner.phases
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.store.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.store.watch()
    }

    /// Mark `phase` as processing (the caller just triggered it on the
    /// server) and start the push and poll loops if they are not running.
    pub fn begin(&self, phase: &str, total: Option<u64>) -> Transition {
        self.inner.start_phase(phase, total)
    }

    /// Pick up processing that is already running on the server, e.g.
    /// after a restart. Returns the phases that were started.
    pub async fn resume(&self) -> Result<Vec<String>, ApiError> {
        let snapshot = self.inner.transport.fetch_status(&self.inner.subject).await?;
        let mut started = Vec::new();
        for spec in &self.inner.phases {
            let Some(remote) = snapshot.phases.get(&spec.name) else {
                continue;
            };
            if remote.status != ProcessingStatus::Processing {
                continue;
            }
            if self.inner.start_phase(&spec.name, Some(remote.total)).is_applied() {
                started.push(spec.name.clone());
            }
        }
        self.inner.apply_snapshot(&snapshot);
        tracing::info!(subject = %self.inner.subject, phases = ?started, "Resumed progress sync");
        Ok(started)
    }

    /// Send every item back to its initial state before a re-run.
    pub fn reset_items(&self) {
        self.inner.store.apply(|s| {
            if s.items.is_empty() {
                return Transition::Unchanged;
            }
            s.items.reset();
            Transition::Applied
        });
    }

    /// Resolve once no phase is `processing`.
    pub async fn wait_settled(&self) {
        let mut rx = self.inner.store.watch();
        if rx.wait_for(|s| !s.any_processing()).await.is_err() {
            tracing::debug!("Status store closed while waiting");
        }
    }

    /// Stop observing. Every processing phase returns to `idle` with a
    /// `Cancelled` error and the background loops exit.
    pub fn cancel(&self) {
        let names = self.inner.store.read(SyncStatus::processing_phases);
        for name in names {
            self.inner.fail_phase(&name, PhaseError::cancelled());
        }
    }

    /// Cancel and wait for the background loops to exit.
    pub async fn shutdown(&self) {
        tracing::info!(subject = %self.inner.subject, "Shutting down progress sync");
        self.cancel();
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// What a phase-level event's scope resolves to.
enum Scoped {
    Phase(String),
    /// Describes an item kind no tracked phase owns.
    Untracked(String),
    /// Neither a phase name nor a recognisable item kind.
    Unscoped,
}

/// Why a push connection ended.
enum PushEnd {
    /// Settled or cancelled; do not reconnect.
    Stopped,
    Lost(String),
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn spec_for_kind(&self, kind: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.item_kind == kind)
    }

    fn dependent_of(&self, phase: &str) -> Option<&PhaseSpec> {
        self.phases
            .iter()
            .find(|p| p.depends_on.as_deref() == Some(phase))
    }

    fn is_active(&self, epoch: u64) -> bool {
        self.store.read(|s| s.is_active(epoch))
    }

    /// Resolves once the loops started for `epoch` should stop.
    async fn settled(&self, epoch: u64) {
        let mut rx = self.store.watch();
        if rx.wait_for(|s| !s.is_active(epoch)).await.is_err() {
            tracing::debug!(subject = %self.subject, "Status store closed");
        }
    }

    fn scoped(&self, scope: PhaseScope) -> Scoped {
        if let Some(name) = scope.phase {
            return Scoped::Phase(name);
        }
        match scope.kind {
            Some(kind) => match self.spec_for_kind(&kind) {
                Some(spec) => Scoped::Phase(spec.name.clone()),
                None => Scoped::Untracked(kind),
            },
            None => Scoped::Unscoped,
        }
    }

    /// Phase a `processing_started` refers to; unscoped means the first
    /// declared phase.
    fn started_phase(&self, scope: PhaseScope) -> Option<String> {
        match self.scoped(scope) {
            Scoped::Phase(name) => Some(name),
            Scoped::Untracked(_) => None,
            Scoped::Unscoped => self.phases.first().map(|p| p.name.clone()),
        }
    }

    /// Phase a completion or error refers to. An unscoped event applies
    /// only when exactly one phase is processing; otherwise it is dropped
    /// and the tagged event or the next poll settles the phase.
    fn terminal_phase(&self, scope: PhaseScope, event: &str) -> Option<String> {
        match self.scoped(scope) {
            Scoped::Phase(name) => Some(name),
            Scoped::Untracked(kind) => {
                tracing::debug!(
                    subject = %self.subject,
                    event,
                    kind = %kind,
                    "Phase event for untracked item kind ignored",
                );
                None
            }
            Scoped::Unscoped => {
                let processing = self.store.read(SyncStatus::processing_phases);
                match <[String; 1]>::try_from(processing) {
                    Ok([only]) => Some(only),
                    Err(processing) => {
                        tracing::warn!(
                            subject = %self.subject,
                            event,
                            processing = ?processing,
                            "Phase-less event is ambiguous, ignoring",
                        );
                        None
                    }
                }
            }
        }
    }

    // ---- phase transitions ----

    fn start_phase(self: &Arc<Self>, phase: &str, total: Option<u64>) -> Transition {
        let mut fresh = false;
        let mut new_epoch = None;
        let mut started_total = 0;

        let outcome = self.store.apply(|s| {
            let was_active = s.any_processing();
            let Some(state) = s.phases.get_mut(phase) else {
                return Transition::Rejected;
            };
            let was_processing = state.is_processing();
            let outcome = state.start(total);
            if outcome.is_applied() {
                fresh = !was_processing;
                started_total = state.total;
                if !was_active {
                    s.epoch += 1;
                    s.banner = None;
                    new_epoch = Some(s.epoch);
                }
            }
            outcome
        });

        match outcome {
            Transition::Rejected => {
                tracing::warn!(subject = %self.subject, phase, "Cannot start unknown phase");
            }
            Transition::Applied if fresh => {
                tracing::info!(
                    subject = %self.subject,
                    phase,
                    total = started_total,
                    "Phase processing started",
                );
                self.emit(SyncEvent::PhaseStarted {
                    phase: phase.to_string(),
                    total: started_total,
                });
            }
            Transition::Applied | Transition::Unchanged => {}
        }

        if let Some(epoch) = new_epoch {
            self.spawn_loops(epoch);
        }
        outcome
    }

    fn complete_phase(&self, phase: &str, via: CompletionSource) -> Transition {
        let outcome = self.store.apply(|s| {
            s.phases
                .get_mut(phase)
                .map_or(Transition::Rejected, |state| state.complete())
        });
        if outcome.is_applied() {
            tracing::info!(subject = %self.subject, phase, via = ?via, "Phase complete");
            self.emit(SyncEvent::PhaseCompleted {
                phase: phase.to_string(),
                via,
            });
        }
        outcome
    }

    fn fail_phase(&self, phase: &str, error: PhaseError) -> Transition {
        let recorded = error.clone();
        let outcome = self.store.apply(|s| {
            s.phases
                .get_mut(phase)
                .map_or(Transition::Rejected, |state| state.fail(error))
        });
        if outcome.is_applied() {
            if recorded.is_cancelled() {
                tracing::info!(subject = %self.subject, phase, "Phase tracking cancelled");
            } else {
                tracing::warn!(subject = %self.subject, phase, error = %recorded, "Phase failed");
            }
            self.emit(SyncEvent::PhaseFailed {
                phase: phase.to_string(),
                error: recorded,
            });
        }
        outcome
    }

    /// Merge counters into a processing phase.
    fn record_progress(&self, phase: &str, completed: u64, total: u64, mode: CounterUpdate) {
        let mut counts = (0, 0);
        let outcome = self.store.apply(|s| {
            let Some(state) = s.phases.get_mut(phase) else {
                return Transition::Rejected;
            };
            if !state.is_processing() {
                return Transition::Unchanged;
            }
            let outcome = state.record_progress(completed, total, mode);
            counts = (state.completed, state.total);
            outcome
        });
        if outcome.is_applied() {
            self.emit(SyncEvent::PhaseProgress {
                phase: phase.to_string(),
                completed: counts.0,
                total: counts.1,
            });
        }
    }

    fn set_push_connected(&self, connected: bool) {
        let outcome = self.store.apply(|s| {
            if s.push_connected == connected {
                return Transition::Unchanged;
            }
            s.push_connected = connected;
            Transition::Applied
        });
        if outcome.is_applied() {
            self.emit(if connected {
                SyncEvent::PushConnected
            } else {
                SyncEvent::PushDisconnected
            });
        }
    }

    // ---- background loops ----

    fn spawn_loops(self: &Arc<Self>, epoch: u64) {
        if self.cancel.is_cancelled() {
            tracing::debug!(subject = %self.subject, "Synchronizer shut down, not spawning loops");
            return;
        }
        let push = self.transport.has_progress_stream();
        tracing::debug!(subject = %self.subject, epoch, push, "Starting progress loops");

        if push {
            let inner = Arc::clone(self);
            self.tasks.spawn(async move {
                inner.run_push(epoch).await;
                tracing::debug!(subject = %inner.subject, epoch, "Push loop exited");
            });
        }

        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            inner.run_poll(epoch).await;
            tracing::debug!(subject = %inner.subject, epoch, "Poll loop exited");
        });
    }

    /// Connect -> read events -> back off -> reconnect, until settled.
    async fn run_push(self: &Arc<Self>, epoch: u64) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut attempt: u32 = 0;
        let settled = self.settled(epoch);
        tokio::pin!(settled);

        loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut settled => break,
                opened = self.transport.open_progress_stream(&self.subject) => opened,
            };

            match opened {
                Ok(stream) => {
                    backoff.reset();
                    attempt = 0;
                    tracing::info!(subject = %self.subject, "Progress stream connected");
                    self.set_push_connected(true);
                    let end = self.read_push(stream, epoch).await;
                    self.set_push_connected(false);
                    match end {
                        PushEnd::Stopped => break,
                        PushEnd::Lost(reason) => {
                            tracing::warn!(
                                subject = %self.subject,
                                reason = %reason,
                                "Progress stream lost",
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        subject = %self.subject,
                        error = %e,
                        "Failed to open progress stream",
                    );
                }
            }

            if !self.is_active(epoch) {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff.on_failure();
            tracing::info!(
                subject = %self.subject,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting progress stream",
            );
            self.emit(SyncEvent::Reconnecting { attempt, delay });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut settled => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_push(self: &Arc<Self>, mut stream: ByteStream, epoch: u64) -> PushEnd {
        let mut decoder = FrameDecoder::new();
        let settled = self.settled(epoch);
        tokio::pin!(settled);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PushEnd::Stopped,
                _ = &mut settled => return PushEnd::Stopped,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.push(&chunk) {
                        if !self.is_active(epoch) {
                            return PushEnd::Stopped;
                        }
                        self.apply_frame(&frame);
                    }
                }
                Some(Err(e)) => return PushEnd::Lost(e.to_string()),
                None => {
                    if let Some(frame) = decoder.finish() {
                        if self.is_active(epoch) {
                            self.apply_frame(&frame);
                        }
                    }
                    return PushEnd::Lost("stream ended".to_string());
                }
            }
        }
    }

    async fn run_poll(&self, epoch: u64) {
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let settled = self.settled(epoch);
        tokio::pin!(settled);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut settled => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut settled => break,
                fetched = self.transport.fetch_status(&self.subject) => fetched,
            };

            match fetched {
                Ok(snapshot) => self.apply_snapshot(&snapshot),
                Err(e) => {
                    tracing::warn!(subject = %self.subject, error = %e, "Status poll failed");
                    let error = PhaseError::new(ErrorKind::Network, e.to_string());
                    let banner = error.clone();
                    self.store.apply(|s| {
                        s.banner = Some(banner);
                        Transition::Applied
                    });
                    self.emit(SyncEvent::PollFailed { error });
                }
            }
        }
    }

    // ---- pull channel ----

    /// Apply one authoritative status report. Phases that are not
    /// processing locally are left alone.
    fn apply_snapshot(&self, snapshot: &StatusSnapshot) {
        self.store.apply(|s| {
            if s.banner.take().is_some() {
                Transition::Applied
            } else {
                Transition::Unchanged
            }
        });

        for spec in &self.phases {
            let Some(remote) = snapshot.phases.get(&spec.name) else {
                continue;
            };
            let local_processing = self.store.read(|s| {
                s.phase(&spec.name).is_some_and(|state| state.is_processing())
            });
            if !local_processing {
                continue;
            }

            match remote.status {
                ProcessingStatus::Processing => {
                    self.record_progress(
                        &spec.name,
                        remote.completed,
                        remote.total,
                        CounterUpdate::Authoritative,
                    );
                }
                ProcessingStatus::Complete => {
                    self.record_progress(
                        &spec.name,
                        remote.completed,
                        remote.total,
                        CounterUpdate::Authoritative,
                    );
                    self.complete_phase(&spec.name, CompletionSource::Poll);
                }
                ProcessingStatus::Idle => {
                    self.fail_phase(
                        &spec.name,
                        PhaseError::new(
                            ErrorKind::Remote,
                            format!("server reports {} as idle while processing", spec.name),
                        ),
                    );
                }
            }
        }
    }

    // ---- push channel ----

    fn apply_frame(self: &Arc<Self>, frame: &Frame) {
        let event = match parse_progress_event(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    subject = %self.subject,
                    event = %frame.name(),
                    error = %e,
                    "Malformed progress event, skipping",
                );
                return;
            }
        };

        match event {
            ProgressEvent::Connected { subject } => {
                tracing::debug!(subject = %self.subject, reported = ?subject, "Stream handshake");
            }
            ProgressEvent::ProcessingStarted(data) => {
                if let Some(phase) = self.started_phase(data.scope) {
                    self.start_phase(&phase, data.total);
                }
            }
            ProgressEvent::PassComplete { pass, update } => self.apply_pass_complete(pass, update),
            ProgressEvent::ItemReady(update) => self.apply_item_ready(update),
            ProgressEvent::ItemProcessing(update) => self.apply_item_processing(update),
            ProgressEvent::ItemComplete(update) => self.apply_item_complete(update),
            ProgressEvent::ItemError { item_id, pass, error } => {
                tracing::warn!(
                    subject = %self.subject,
                    item_id = ?item_id,
                    pass = ?pass,
                    error = %error,
                    "Item processing failed",
                );
            }
            ProgressEvent::PassSummary { pass, completed, errors } => {
                tracing::debug!(
                    subject = %self.subject,
                    pass,
                    completed = ?completed,
                    errors = ?errors,
                    "Pass finished",
                );
            }
            ProgressEvent::ProcessingComplete(scope) => {
                if let Some(phase) = self.terminal_phase(scope, frame.name()) {
                    if !self.complete_phase(&phase, CompletionSource::Push).is_applied() {
                        tracing::debug!(
                            subject = %self.subject,
                            phase = %phase,
                            "Completion for a phase that is not processing ignored",
                        );
                    }
                }
            }
            ProgressEvent::ProcessingError(data) => {
                if let Some(phase) = self.terminal_phase(data.scope, frame.name()) {
                    self.fail_phase(&phase, PhaseError::new(ErrorKind::Remote, data.error));
                }
            }
            ProgressEvent::Unknown(name) => {
                tracing::debug!(subject = %self.subject, event = %name, "Ignoring unknown event");
            }
        }
    }

    /// Resolve the phase and item key an item event refers to.
    fn item_target(&self, update: &ItemUpdate) -> Option<(PhaseSpec, ItemKey)> {
        let Some(spec) = self.spec_for_kind(&update.kind) else {
            tracing::debug!(
                subject = %self.subject,
                kind = %update.kind,
                "Event for untracked item kind",
            );
            return None;
        };
        let Some(id) = update.item_id.clone() else {
            tracing::warn!(subject = %self.subject, kind = %update.kind, "Item event without id");
            return None;
        };
        Some((spec.clone(), ItemKey::new(&update.kind, id)))
    }

    fn emit_item(&self, key: &ItemKey, status: ItemStatus) {
        self.emit(SyncEvent::ItemChanged {
            kind: key.kind.clone(),
            id: key.id.clone(),
            status,
        });
    }

    fn protocol_violation(&self, key: &ItemKey, reason: &str) {
        tracing::warn!(
            subject = %self.subject,
            kind = %key.kind,
            item_id = %key.id,
            reason,
            "Protocol violation in progress stream",
        );
    }

    /// `<kind>_pass<N>_complete`: intermediate passes mean the item is
    /// being processed; the last pass completes it.
    fn apply_pass_complete(&self, pass: u32, update: ItemUpdate) {
        let Some((spec, key)) = self.item_target(&update) else {
            return;
        };

        if let (Some(group), Some(dependent)) = (&update.group, self.dependent_of(&spec.name)) {
            let parent = ItemKey::new(&dependent.item_kind, group);
            let child = key.clone();
            self.store.apply(|s| {
                let before = s.items.clone();
                s.items.add_dependency(parent, child);
                if s.items == before {
                    Transition::Unchanged
                } else {
                    Transition::Applied
                }
            });
        }

        if pass < spec.passes {
            let outcome = self.store.apply(|s| s.items.mark_processing(&key));
            match outcome {
                Transition::Applied => self.emit_item(&key, ItemStatus::Processing),
                Transition::Rejected => self.protocol_violation(&key, "pass reported before ready"),
                Transition::Unchanged => {}
            }
            return;
        }

        let mut promoted = Vec::new();
        let outcome = self.store.apply(|s| {
            let (outcome, ready) = s.items.mark_complete(&key);
            promoted = ready;
            outcome
        });
        match outcome {
            Transition::Applied => {
                self.emit_item(&key, ItemStatus::Complete);
                for ready in &promoted {
                    self.emit_item(ready, ItemStatus::Ready);
                }
            }
            Transition::Rejected => self.protocol_violation(&key, "completed while waiting"),
            Transition::Unchanged => {}
        }

        if let (Some(completed), Some(total)) = (update.completed, update.total) {
            self.record_progress(&spec.name, completed, total, CounterUpdate::Monotonic);
        }
    }

    fn apply_item_ready(&self, update: ItemUpdate) {
        let Some((_, key)) = self.item_target(&update) else {
            return;
        };
        match self.store.apply(|s| s.items.mark_ready(&key)) {
            Transition::Applied => self.emit_item(&key, ItemStatus::Ready),
            Transition::Rejected => {
                self.protocol_violation(&key, "ready before its dependencies completed")
            }
            Transition::Unchanged => {}
        }
    }

    fn apply_item_processing(&self, update: ItemUpdate) {
        let Some((_, key)) = self.item_target(&update) else {
            return;
        };
        match self.store.apply(|s| s.items.mark_processing(&key)) {
            Transition::Applied => self.emit_item(&key, ItemStatus::Processing),
            Transition::Rejected => self.protocol_violation(&key, "processing before ready"),
            Transition::Unchanged => {}
        }
    }

    fn apply_item_complete(&self, update: ItemUpdate) {
        let Some((spec, key)) = self.item_target(&update) else {
            return;
        };

        let mut promoted = Vec::new();
        let mut counts = (0, 0);
        let outcome = self.store.apply(|s| {
            let (outcome, ready) = s.items.mark_complete(&key);
            promoted = ready;
            if let Some(state) = s.phases.get(&spec.name) {
                counts = (
                    update.completed.unwrap_or(state.completed + 1),
                    update.total.unwrap_or(state.total),
                );
            }
            outcome
        });

        match outcome {
            Transition::Applied => {
                self.emit_item(&key, ItemStatus::Complete);
                for ready in &promoted {
                    self.emit_item(ready, ItemStatus::Ready);
                }
                self.record_progress(&spec.name, counts.0, counts.1, CounterUpdate::Monotonic);
            }
            Transition::Rejected => self.protocol_violation(&key, "completed while waiting"),
            Transition::Unchanged => {}
        }
    }
}
