use std::sync::Arc;

use anyhow::Context;
use plansight_client::api::AnalysisApi;
use plansight_client::events::SyncEvent;
use plansight_client::synchronizer::ProgressSynchronizer;
use plansight_core::status::ProcessingStatus;
use plansight_queue::{BatchQueue, BatchState};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "plansight_worker=debug,plansight_client=debug,plansight_queue=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    tracing::info!(
        queue_root = %config.queue.queue_root.display(),
        results_root = %config.queue.results_root.display(),
        api_url = %config.sync.api_url,
        "Loaded worker configuration",
    );

    // --- Queue ---
    let queue = BatchQueue::new(config.queue.clone());
    report_queue(&queue).await?;

    // --- Progress sync ---
    let api = AnalysisApi::new(config.sync.api_url.clone());
    if let Some(project_id) = &config.watch_project_id {
        let transport = Arc::new(api.clone());
        watch(ProgressSynchronizer::new(project_id, transport, config.sync.clone())).await?;
    }
    if let Some(batch_id) = &config.watch_batch_id {
        watch(ProgressSynchronizer::for_batch(batch_id, api, config.sync.clone())).await?;
    }

    Ok(())
}

/// Log completed, malformed and still-pending batches.
async fn report_queue(queue: &BatchQueue) -> anyhow::Result<()> {
    let listing = queue
        .list_completed()
        .await
        .context("Failed to list completed batches")?;

    for batch in &listing.batches {
        tracing::info!(
            batch_id = %batch.batch_id,
            processed_at = %batch.processed_at,
            sheets = batch.sheet_count,
            pointers = batch.pointer_count,
            errors = batch.error_count,
            "Completed batch",
        );
    }
    for malformed in &listing.malformed {
        tracing::warn!(
            batch_id = %malformed.batch_id,
            reason = %malformed.reason,
            "Malformed results",
        );
    }

    let exported = queue
        .list_exported()
        .await
        .context("Failed to list exported batches")?;
    let mut pending = 0usize;
    for manifest in &exported {
        match queue.batch_state(&manifest.batch_id).await {
            Ok(state @ BatchState::Exported) => {
                pending += 1;
                tracing::info!(
                    batch_id = %manifest.batch_id,
                    exported_at = %manifest.exported_at,
                    pointers = manifest.pointer_count(),
                    status = ?state.status(),
                    "Awaiting results",
                );
            }
            Ok(state) => {
                tracing::debug!(batch_id = %manifest.batch_id, state = ?state, "Not pending");
            }
            Err(e) => {
                tracing::warn!(
                    batch_id = %manifest.batch_id,
                    error = %e,
                    "Failed to read batch state",
                );
            }
        }
    }

    tracing::info!(
        completed = listing.batches.len(),
        malformed = listing.malformed.len(),
        pending,
        "Queue scan complete",
    );
    Ok(())
}

/// Follow a subject's server-side processing until it settles or the
/// process is interrupted.
async fn watch(sync: ProgressSynchronizer) -> anyhow::Result<()> {
    let subject = sync.subject().to_string();
    let log_handle = tokio::spawn(log_sync_events(sync.subscribe()));

    let started = sync
        .resume()
        .await
        .with_context(|| format!("Failed to fetch processing status of {subject}"))?;
    if started.is_empty() {
        tracing::info!(subject = %subject, "No processing in progress");
        log_handle.abort();
        return Ok(());
    }

    tokio::select! {
        _ = sync.wait_settled() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(subject = %subject, "Interrupted, stopping progress sync");
        }
    }
    sync.shutdown().await;
    log_handle.abort();

    let settled = sync.status();
    for spec in sync.phases() {
        let Some(phase) = settled.phase(&spec.name) else {
            continue;
        };
        let items = settled.items.counts(&spec.item_kind);
        match (phase.status, &phase.error) {
            (ProcessingStatus::Complete, _) => {
                tracing::info!(
                    subject = %subject,
                    phase = %spec.name,
                    total = phase.total,
                    items_complete = items.complete,
                    "Phase complete",
                );
            }
            (_, Some(error)) => {
                tracing::warn!(
                    subject = %subject,
                    phase = %spec.name,
                    error = %error,
                    items_waiting = items.waiting,
                    "Phase did not complete",
                );
            }
            (status, None) => {
                tracing::debug!(
                    subject = %subject,
                    phase = %spec.name,
                    status = %status.as_str(),
                    "Phase untouched",
                );
            }
        }
    }
    Ok(())
}

async fn log_sync_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::PhaseProgress {
                phase,
                completed,
                total,
            }) => {
                tracing::info!(phase = %phase, completed, total, "Progress");
            }
            Ok(SyncEvent::Reconnecting { attempt, delay }) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            }
            Ok(event) => tracing::debug!(event = ?event, "Sync event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
