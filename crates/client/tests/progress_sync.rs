use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{stream, StreamExt};
use plansight_client::api::ApiError;
use plansight_client::events::{CompletionSource, SyncEvent};
use plansight_client::reconnect::ReconnectConfig;
use plansight_client::synchronizer::{PhaseSpec, ProgressSynchronizer, SyncConfig};
use plansight_client::transport::{ByteStream, PhaseSnapshot, ProgressTransport, StatusSnapshot};
use plansight_core::error::ErrorKind;
use plansight_core::items::{ItemKey, ItemStatus};
use plansight_core::status::ProcessingStatus;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// One push connection attempt.
enum Push {
    Refuse,
    /// Frames, each delivered after its delay, then the stream closes.
    Close(Vec<(Duration, Vec<u8>)>),
    /// Frames, then the stream stays open.
    Hold(Vec<(Duration, Vec<u8>)>),
    /// The connection attempt never resolves.
    Stall,
}

/// Counts connection attempts dropped before they resolved.
struct Abandoned(Arc<AtomicUsize>);

impl Drop for Abandoned {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedProgress {
    started: Instant,
    has_stream: bool,
    pushes: Mutex<VecDeque<Push>>,
    polls: Mutex<VecDeque<Result<StatusSnapshot, u16>>>,
    push_opens: Mutex<Vec<Duration>>,
    abandoned_opens: Arc<AtomicUsize>,
    poll_times: Mutex<Vec<Duration>>,
}

impl ScriptedProgress {
    fn new(pushes: Vec<Push>, polls: Vec<Result<StatusSnapshot, u16>>) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            has_stream: true,
            pushes: Mutex::new(pushes.into()),
            polls: Mutex::new(polls.into()),
            push_opens: Mutex::new(Vec::new()),
            abandoned_opens: Arc::new(AtomicUsize::new(0)),
            poll_times: Mutex::new(Vec::new()),
        })
    }

    /// A subject that only has a status endpoint.
    fn poll_only(polls: Vec<Result<StatusSnapshot, u16>>) -> Arc<Self> {
        let mut transport = Self::new(Vec::new(), polls);
        if let Some(t) = Arc::get_mut(&mut transport) {
            t.has_stream = false;
        }
        transport
    }

    fn abandoned_opens(&self) -> usize {
        self.abandoned_opens.load(Ordering::SeqCst)
    }

    fn push_opens(&self) -> Vec<Duration> {
        self.push_opens.lock().unwrap().clone()
    }

    fn poll_count(&self) -> usize {
        self.poll_times.lock().unwrap().len()
    }
}

fn delayed(frames: Vec<(Duration, Vec<u8>)>) -> impl futures::Stream<Item = Result<Vec<u8>, ApiError>> {
    stream::unfold(frames.into_iter(), |mut frames| async move {
        let (delay, bytes) = frames.next()?;
        tokio::time::sleep(delay).await;
        Some((Ok(bytes), frames))
    })
}

#[async_trait::async_trait]
impl ProgressTransport for ScriptedProgress {
    fn has_progress_stream(&self) -> bool {
        self.has_stream
    }

    async fn open_progress_stream(&self, _subject: &str) -> Result<ByteStream, ApiError> {
        self.push_opens.lock().unwrap().push(self.started.elapsed());
        let next = self.pushes.lock().unwrap().pop_front().unwrap_or(Push::Refuse);
        match next {
            Push::Refuse => Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Push::Close(frames) => Ok(delayed(frames).boxed()),
            Push::Hold(frames) => Ok(delayed(frames).chain(stream::pending()).boxed()),
            Push::Stall => {
                let _abandoned = Abandoned(Arc::clone(&self.abandoned_opens));
                std::future::pending().await
            }
        }
    }

    async fn fetch_status(&self, _subject: &str) -> Result<StatusSnapshot, ApiError> {
        self.poll_times.lock().unwrap().push(self.started.elapsed());
        let next = self
            .polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(pages(ProcessingStatus::Processing, 0, 2)));
        next.map_err(|status| ApiError::Status {
            status,
            body: "poll failed".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const LONG: Duration = Duration::from_secs(3600);

fn config(poll_interval: Duration) -> SyncConfig {
    SyncConfig {
        poll_interval,
        reconnect: ReconnectConfig::default(),
        ..SyncConfig::default()
    }
}

fn pages(status: ProcessingStatus, completed: u64, total: u64) -> StatusSnapshot {
    StatusSnapshot::default().with_phase(
        "pages",
        PhaseSnapshot {
            status,
            completed,
            total,
        },
    )
}

fn phases(entries: &[(&str, ProcessingStatus, u64, u64)]) -> StatusSnapshot {
    entries
        .iter()
        .fold(StatusSnapshot::default(), |snapshot, &(name, status, completed, total)| {
            snapshot.with_phase(
                name,
                PhaseSnapshot {
                    status,
                    completed,
                    total,
                },
            )
        })
}

fn frame(event: &str, data: Value) -> Vec<u8> {
    format!("event: {event}\ndata: {data}\n\n").into_bytes()
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Elapsed times rounded to the nearest 100ms.
fn rounded(times: &[Duration]) -> Vec<u128> {
    times.iter().map(|t| (t.as_millis() + 50) / 100 * 100).collect()
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

fn completions(events: &[SyncEvent]) -> Vec<(String, CompletionSource)> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::PhaseCompleted { phase, via } => Some((phase.clone(), *via)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_and_resets_after_a_connection() {
    let transport = ScriptedProgress::new(
        vec![
            Push::Refuse,
            Push::Refuse,
            Push::Refuse,
            Push::Close(Vec::new()),
            Push::Hold(Vec::new()),
        ],
        Vec::new(),
    );
    let sync = ProgressSynchronizer::new("proj-1", transport.clone(), config(LONG));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    while transport.push_opens().len() < 5 {
        tokio::time::sleep(ms(100)).await;
    }

    assert_eq!(rounded(&transport.push_opens()), [0, 1000, 3000, 7000, 8000]);

    let delays: Vec<(u32, Duration)> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::Reconnecting { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        [
            (1, ms(1000)),
            (2, ms(2000)),
            (3, ms(4000)),
            (1, ms(1000)),
        ]
    );
    assert!(sync.status().push_connected);

    sync.shutdown().await;
    assert!(!sync.status().push_connected);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_the_reconnect_sleep() {
    let transport = ScriptedProgress::new(Vec::new(), Vec::new());
    let sync = ProgressSynchronizer::new("proj-1", transport.clone(), config(LONG));

    sync.begin("pages", None);
    tokio::time::sleep(ms(2500)).await;
    assert_eq!(transport.push_opens().len(), 2);

    sync.cancel();
    sync.wait_settled().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.push_opens().len(), 2);
    let status = sync.status();
    let pages = status.phase("pages").unwrap();
    assert_eq!(pages.status, ProcessingStatus::Idle);
    assert_matches!(&pages.error, Some(e) if e.kind == ErrorKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn poll_completion_abandons_a_pending_connection() {
    let transport = ScriptedProgress::new(
        vec![Push::Stall],
        vec![Ok(pages(ProcessingStatus::Complete, 2, 2))],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport.clone(), config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.wait_settled().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.push_opens().len(), 1);
    assert_eq!(transport.abandoned_opens(), 1);
    assert_eq!(transport.poll_count(), 1);
    let received = drain(&mut events);
    assert_eq!(
        completions(&received),
        [("pages".to_string(), CompletionSource::Poll)]
    );
    assert!(!received
        .iter()
        .any(|e| matches!(e, SyncEvent::Reconnecting { .. } | SyncEvent::PushConnected)));
    assert!(!sync.status().push_connected);
}

#[tokio::test(start_paused = true)]
async fn push_completion_stops_polling() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![
            (ms(100), frame("connected", json!({"project_id": "proj-1"}))),
            (ms(100), frame("processing_complete", json!({"phase": "pages"}))),
        ])],
        Vec::new(),
    );
    let sync = ProgressSynchronizer::new("proj-1", transport.clone(), config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.wait_settled().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(sync.status().phase("pages").unwrap().status, ProcessingStatus::Complete);
    assert_eq!(transport.poll_count(), 0);
    assert_eq!(transport.push_opens().len(), 1);
    assert_eq!(
        completions(&drain(&mut events)),
        [("pages".to_string(), CompletionSource::Push)]
    );
}

#[tokio::test(start_paused = true)]
async fn processing_error_fails_the_phase() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![(
            ms(100),
            frame("processing_error", json!({"error": "worker crashed"})),
        )])],
        Vec::new(),
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(LONG));

    sync.begin("pages", None);
    sync.wait_settled().await;

    let status = sync.status();
    let pages = status.phase("pages").unwrap();
    assert_eq!(pages.status, ProcessingStatus::Idle);
    assert_matches!(&pages.error, Some(e) if e.kind == ErrorKind::Remote && e.message == "worker crashed");
}

#[tokio::test(start_paused = true)]
async fn page_summary_completion_never_completes_disciplines() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![(
            ms(1500),
            frame("processing_complete", json!({"pass1_completed": 2, "pass2_completed": 2})),
        )])],
        vec![Ok(phases(&[
            ("pages", ProcessingStatus::Complete, 2, 2),
            ("disciplines", ProcessingStatus::Processing, 0, 3),
        ]))],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.begin("disciplines", Some(3));
    tokio::time::sleep(ms(2000)).await;

    let status = sync.status();
    assert_eq!(status.phase("pages").unwrap().status, ProcessingStatus::Complete);
    let disciplines = status.phase("disciplines").unwrap();
    assert!(disciplines.is_processing());
    assert_eq!((disciplines.completed, disciplines.total), (0, 3));
    assert_eq!(
        completions(&drain(&mut events)),
        [("pages".to_string(), CompletionSource::Poll)]
    );

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unscoped_completion_is_ignored_while_two_phases_run() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![
            (ms(100), frame("processing_complete", json!({"jobId": "j1"}))),
            (ms(100), frame("processing_error", json!({"error": "boom"}))),
            (ms(100), frame("processing_complete", json!({"phase": "disciplines"}))),
        ])],
        Vec::new(),
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(LONG));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.begin("disciplines", Some(3));
    tokio::time::sleep(ms(500)).await;

    let status = sync.status();
    let pages = status.phase("pages").unwrap();
    assert!(pages.is_processing());
    assert!(pages.error.is_none());
    assert_eq!(status.phase("disciplines").unwrap().status, ProcessingStatus::Complete);
    assert_eq!(
        completions(&drain(&mut events)),
        [("disciplines".to_string(), CompletionSource::Push)]
    );

    sync.shutdown().await;
}

// ---------------------------------------------------------------------------
// Pull channel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn completion_is_recorded_once_when_poll_wins_the_race() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![(
            ms(1500),
            frame("processing_complete", json!({"phase": "pages"})),
        )])],
        vec![Ok(pages(ProcessingStatus::Complete, 2, 2))],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport.clone(), config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.wait_settled().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let status = sync.status();
    let phase = status.phase("pages").unwrap();
    assert_eq!(phase.status, ProcessingStatus::Complete);
    assert_eq!((phase.completed, phase.total), (2, 2));

    assert_eq!(
        completions(&drain(&mut events)),
        [("pages".to_string(), CompletionSource::Poll)]
    );
    assert_eq!(transport.poll_count(), 1);
    assert_eq!(transport.push_opens().len(), 1);
    assert!(!status.push_connected);
}

#[tokio::test(start_paused = true)]
async fn poll_counters_replace_local_counters() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(Vec::new())],
        vec![
            Ok(pages(ProcessingStatus::Processing, 3, 10)),
            Ok(pages(ProcessingStatus::Processing, 2, 8)),
        ],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(ms(1000)));

    sync.begin("pages", Some(4));
    tokio::time::sleep(ms(1500)).await;
    let first = sync.status().phase("pages").cloned().unwrap();
    tokio::time::sleep(ms(1000)).await;
    let second = sync.status().phase("pages").cloned().unwrap();

    assert_eq!((first.completed, first.total), (3, 10));
    assert_eq!((second.completed, second.total), (2, 8));

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_reporting_idle_fails_the_processing_phase() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(Vec::new())],
        vec![Ok(pages(ProcessingStatus::Idle, 0, 0))],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    sync.wait_settled().await;

    let status = sync.status();
    let pages = status.phase("pages").unwrap();
    assert_eq!(pages.status, ProcessingStatus::Idle);
    assert_matches!(&pages.error, Some(e) if e.kind == ErrorKind::Remote);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::PhaseFailed { phase, .. } if phase == "pages")));
}

#[tokio::test(start_paused = true)]
async fn poll_errors_raise_a_banner_until_the_next_success() {
    let transport = ScriptedProgress::new(vec![Push::Hold(Vec::new())], vec![Err(502)]);
    let sync = ProgressSynchronizer::new("proj-1", transport, config(ms(1000)));
    let mut events = sync.subscribe();

    sync.begin("pages", Some(2));
    tokio::time::sleep(ms(1500)).await;

    let status = sync.status();
    assert_matches!(&status.banner, Some(e) if e.kind == ErrorKind::Network);
    assert!(status.phase("pages").unwrap().is_processing());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::PollFailed { .. })));

    tokio::time::sleep(ms(1000)).await;
    assert!(sync.status().banner.is_none());

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resume_picks_up_processing_reported_by_the_server() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(Vec::new())],
        vec![Ok(pages(ProcessingStatus::Processing, 1, 4))],
    );
    let sync = ProgressSynchronizer::new("proj-1", transport, config(LONG));

    let started = sync.resume().await.unwrap();

    assert_eq!(started, ["pages"]);
    let status = sync.status();
    let pages = status.phase("pages").unwrap();
    assert!(pages.is_processing());
    assert_eq!((pages.completed, pages.total), (1, 4));
    assert_eq!(status.phase("disciplines").unwrap().status, ProcessingStatus::Idle);

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_without_a_stream_is_polled_to_completion() {
    let batch = |status, completed| {
        StatusSnapshot::default().with_phase(
            "batch",
            PhaseSnapshot {
                status,
                completed,
                total: 3,
            },
        )
    };
    let transport = ScriptedProgress::poll_only(vec![
        Ok(batch(ProcessingStatus::Processing, 0)),
        Ok(batch(ProcessingStatus::Processing, 2)),
        Ok(batch(ProcessingStatus::Complete, 3)),
    ]);
    let sync = ProgressSynchronizer::with_phases(
        "batch_42",
        transport.clone(),
        config(ms(1000)),
        vec![PhaseSpec::batch()],
    );
    let mut events = sync.subscribe();

    assert_eq!(sync.resume().await.unwrap(), ["batch"]);
    sync.wait_settled().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let status = sync.status();
    let phase = status.phase("batch").unwrap();
    assert_eq!(phase.status, ProcessingStatus::Complete);
    assert_eq!((phase.completed, phase.total), (3, 3));
    assert_eq!(transport.poll_count(), 3);
    assert!(transport.push_opens().is_empty());
    assert_eq!(
        completions(&drain(&mut events)),
        [("batch".to_string(), CompletionSource::Poll)]
    );
}

// ---------------------------------------------------------------------------
// Item board
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn discipline_waits_for_its_pages() {
    let transport = ScriptedProgress::new(
        vec![Push::Hold(vec![
            (ms(100), frame("page_pass1_complete", json!({"page_id": "pg1", "discipline": "A"}))),
            (ms(100), frame("discipline_ready", json!({"discipline_code": "A"}))),
            (
                ms(100),
                frame(
                    "page_pass2_complete",
                    json!({"page_id": "pg1", "discipline": "A", "pass2_progress": 1, "pass2_total": 1}),
                ),
            ),
            (ms(100), frame("processing_complete", json!({"phase": "pages"}))),
        ])],
        Vec::new(),
    );
    let sync = ProgressSynchronizer::with_phases(
        "proj-1",
        transport,
        config(LONG),
        PhaseSpec::defaults(),
    );
    let mut events = sync.subscribe();

    sync.begin("pages", Some(1));
    let mut rx = sync.watch();
    rx.wait_for(|s| s.items.status(&ItemKey::new("page", "pg1")) == Some(ItemStatus::Processing))
        .await
        .unwrap();
    tokio::time::sleep(ms(150)).await;
    assert_eq!(
        sync.status().items.status(&ItemKey::new("discipline", "A")),
        Some(ItemStatus::Waiting)
    );

    sync.wait_settled().await;

    let status = sync.status();
    assert_eq!(status.items.status(&ItemKey::new("page", "pg1")), Some(ItemStatus::Complete));
    assert_eq!(status.items.status(&ItemKey::new("discipline", "A")), Some(ItemStatus::Ready));
    let pages = status.phase("pages").unwrap();
    assert_eq!(pages.status, ProcessingStatus::Complete);
    assert_eq!((pages.completed, pages.total), (1, 1));

    let ready: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(e, SyncEvent::ItemChanged { kind, status: ItemStatus::Ready, .. } if kind == "discipline")
        })
        .collect();
    assert_eq!(ready.len(), 1);
}
