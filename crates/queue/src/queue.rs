//! The filesystem job queue shared with the external analysis worker.
//!
//! ```text
//! queue/{batchId}/manifest.json                       written last
//! queue/{batchId}/{sheetId}/{pointerId}/image.<ext>
//! queue/{batchId}/{sheetId}/{pointerId}/metadata.json
//! queue/{batchId}/discarded                           written by discard
//! results/{batchId}/results.json                      written by the worker
//! ```
//!
//! A batch directory without a manifest is still being staged and is
//! invisible to consumers. Manifest present with no results file means the
//! worker has not finished yet. The `discarded` marker is terminal: the
//! batch disappears from every listing even if results show up later.

use std::path::{Path, PathBuf};

use chrono::Utc;
use plansight_core::batch::{validate_identifier, Batch, BatchStatus};
use plansight_core::files::{
    reconcile_results, Manifest, PointerMetadata, ProtocolViolation, ReconciledResults,
    ResultsFile, DISCARDED_MARKER_FILE_NAME, MANIFEST_FILE_NAME, METADATA_FILE_NAME,
    RESULTS_FILE_NAME,
};
use plansight_core::types::Timestamp;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::fsio;

/// What [`BatchQueue::discard`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    Removed,
    AlreadyAbsent,
}

/// Where a batch currently is in the queue lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Directory exists but the manifest has not been written.
    Staging,
    /// Manifest present, no results yet.
    Exported,
    /// Results file present.
    Processed,
    /// Discard marker present.
    Discarded,
    Unknown,
}

impl BatchState {
    /// Lifecycle status of the batch; `None` for an unknown id.
    pub fn status(self) -> Option<BatchStatus> {
        match self {
            Self::Staging => Some(BatchStatus::Pending),
            Self::Exported => Some(BatchStatus::Exported),
            Self::Processed => Some(BatchStatus::Processed),
            Self::Discarded => Some(BatchStatus::Discarded),
            Self::Unknown => None,
        }
    }
}

/// Summary row of a batch with a valid results file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBatch {
    pub batch_id: String,
    pub processed_at: Timestamp,
    pub sheet_count: usize,
    pub pointer_count: usize,
    pub error_count: usize,
}

/// A results directory whose file could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedBatch {
    pub batch_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedListing {
    /// Newest batch id first.
    pub batches: Vec<CompletedBatch>,
    pub malformed: Vec<MalformedBatch>,
}

/// One pointer of an exported batch as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedPointer {
    pub sheet_id: String,
    pub metadata: PointerMetadata,
    pub image_path: PathBuf,
}

/// A manifest together with every pointer that could be loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedBatch {
    pub manifest: Manifest,
    pub pointers: Vec<ExportedPointer>,
    /// Manifest entries whose files are missing or unreadable.
    pub violations: Vec<ProtocolViolation>,
}

/// Handle on a queue root and a results root.
#[derive(Debug, Clone)]
pub struct BatchQueue {
    config: QueueConfig,
}

impl BatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.config.queue_root.join(batch_id)
    }

    fn manifest_path(&self, batch_id: &str) -> PathBuf {
        self.batch_dir(batch_id).join(MANIFEST_FILE_NAME)
    }

    fn discarded_path(&self, batch_id: &str) -> PathBuf {
        self.batch_dir(batch_id).join(DISCARDED_MARKER_FILE_NAME)
    }

    async fn is_discarded(&self, batch_id: &str) -> Result<bool, QueueError> {
        fsio::exists(&self.discarded_path(batch_id)).await
    }

    fn results_dir(&self, batch_id: &str) -> PathBuf {
        self.config.results_root.join(batch_id)
    }

    fn results_path(&self, batch_id: &str) -> PathBuf {
        self.results_dir(batch_id).join(RESULTS_FILE_NAME)
    }

    // -- Producer side -------------------------------------------------------

    /// Export a batch for the external worker.
    ///
    /// Pointer files are written first; the manifest is written last and
    /// only if every pointer write succeeded.
    pub async fn submit(&self, batch: &Batch) -> Result<Manifest, QueueError> {
        batch.validate()?;

        if self.is_discarded(&batch.id).await? {
            return Err(QueueError::Discarded(batch.id.clone()));
        }
        let manifest_path = self.manifest_path(&batch.id);
        if fsio::exists(&manifest_path).await? {
            return Err(QueueError::AlreadyExported(batch.id.clone()));
        }

        let batch_dir = self.batch_dir(&batch.id);
        for sheet in &batch.sheets {
            for pointer in &sheet.pointers {
                let pointer_dir = batch_dir.join(&sheet.id).join(&pointer.id);
                fsio::create_dir_all(&pointer_dir).await?;

                let image_path =
                    pointer_dir.join(format!("image.{}", fsio::image_extension(&pointer.image)));
                fsio::write_atomic(&image_path, &pointer.image).await?;

                let metadata = PointerMetadata::from(pointer);
                fsio::write_json_atomic(&pointer_dir.join(METADATA_FILE_NAME), &metadata).await?;
            }
        }

        fsio::create_dir_all(&batch_dir).await?;
        let manifest = Manifest::from_batch(batch, Utc::now());
        fsio::write_json_atomic(&manifest_path, &manifest).await?;

        tracing::info!(
            batch_id = %batch.id,
            sheets = batch.sheets.len(),
            pointers = batch.pointer_count(),
            "Batch exported",
        );
        Ok(manifest)
    }

    /// Write a results file for a batch (worker side).
    pub async fn publish_results(&self, results: &ResultsFile) -> Result<(), QueueError> {
        validate_identifier("batch", &results.batch_id)?;

        let dir = self.results_dir(&results.batch_id);
        fsio::create_dir_all(&dir).await?;
        fsio::write_json_atomic(&dir.join(RESULTS_FILE_NAME), results).await?;

        tracing::info!(
            batch_id = %results.batch_id,
            pointers = results.pointer_count(),
            errors = results.error_count(),
            "Results published",
        );
        Ok(())
    }

    // -- Consumer side -------------------------------------------------------

    /// Every batch whose manifest exists and parses, oldest id first.
    pub async fn list_exported(&self) -> Result<Vec<Manifest>, QueueError> {
        let mut manifests = Vec::new();
        for name in fsio::list_subdirectories(&self.config.queue_root).await? {
            if self.is_discarded(&name).await? {
                continue;
            }
            let path = self.manifest_path(&name);
            match fsio::read_json_opt::<Manifest>(&path).await {
                Ok(Some(manifest)) if manifest.batch_id == name => manifests.push(manifest),
                Ok(Some(manifest)) => {
                    tracing::warn!(
                        batch_id = %name,
                        manifest_batch_id = %manifest.batch_id,
                        "Manifest batch id does not match its directory, skipping",
                    );
                }
                Ok(None) => {
                    tracing::debug!(batch_id = %name, "Batch still staging");
                }
                Err(e) => {
                    tracing::warn!(batch_id = %name, error = %e, "Unreadable manifest, skipping");
                }
            }
        }
        manifests.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(manifests)
    }

    /// Load an exported batch's manifest and pointer files.
    pub async fn read_exported(&self, batch_id: &str) -> Result<ExportedBatch, QueueError> {
        validate_identifier("batch", batch_id)?;

        let manifest_path = self.manifest_path(batch_id);
        let manifest: Manifest = fsio::read_json_opt(&manifest_path)
            .await?
            .ok_or_else(|| QueueError::NotFound(batch_id.to_string()))?;
        if manifest.batch_id != batch_id {
            return Err(QueueError::Schema(format!(
                "manifest in '{batch_id}' names batch '{}'",
                manifest.batch_id
            )));
        }

        let batch_dir = self.batch_dir(batch_id);
        let mut pointers = Vec::with_capacity(manifest.pointer_count());
        let mut violations = Vec::new();

        for sheet in &manifest.sheets {
            for pointer_id in &sheet.pointer_ids {
                let pointer_dir = batch_dir.join(&sheet.sheet_id).join(pointer_id);
                match load_pointer(&pointer_dir).await {
                    Ok((metadata, image_path)) => pointers.push(ExportedPointer {
                        sheet_id: sheet.sheet_id.clone(),
                        metadata,
                        image_path,
                    }),
                    Err(reason) => {
                        tracing::warn!(
                            batch_id = %batch_id,
                            sheet_id = %sheet.sheet_id,
                            pointer_id = %pointer_id,
                            reason = %reason,
                            "Exported pointer unusable",
                        );
                        violations.push(ProtocolViolation {
                            sheet_id: Some(sheet.sheet_id.clone()),
                            pointer_id: pointer_id.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        Ok(ExportedBatch {
            manifest,
            pointers,
            violations,
        })
    }

    /// Every batch with a usable results file, plus the ones that were not
    /// usable. A bad file never aborts the scan.
    pub async fn list_completed(&self) -> Result<CompletedListing, QueueError> {
        let mut listing = CompletedListing::default();

        for name in fsio::list_subdirectories(&self.config.results_root).await? {
            if self.is_discarded(&name).await? {
                tracing::debug!(batch_id = %name, "Results of discarded batch, skipping");
                continue;
            }
            let path = self.results_path(&name);
            match fsio::read_json_opt::<ResultsFile>(&path).await {
                Ok(None) => continue,
                Ok(Some(results)) if results.batch_id != name => {
                    listing.malformed.push(MalformedBatch {
                        reason: format!("results file names batch '{}'", results.batch_id),
                        batch_id: name,
                    });
                }
                Ok(Some(results)) => listing.batches.push(CompletedBatch {
                    sheet_count: results.sheets.len(),
                    pointer_count: results.pointer_count(),
                    error_count: results.error_count(),
                    processed_at: results.processed_at,
                    batch_id: results.batch_id,
                }),
                Err(e) => {
                    tracing::warn!(batch_id = %name, error = %e, "Malformed results file");
                    listing.malformed.push(MalformedBatch {
                        batch_id: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        listing.batches.sort_by(|a, b| b.batch_id.cmp(&a.batch_id));
        listing.malformed.sort_by(|a, b| b.batch_id.cmp(&a.batch_id));
        Ok(listing)
    }

    /// Full results of one batch, reconciled against its manifest when the
    /// manifest is still on disk.
    pub async fn fetch_details(&self, batch_id: &str) -> Result<ReconciledResults, QueueError> {
        validate_identifier("batch", batch_id)?;

        let results: ResultsFile = fsio::read_json_opt(&self.results_path(batch_id))
            .await?
            .ok_or_else(|| QueueError::NotFound(batch_id.to_string()))?;
        if results.batch_id != batch_id {
            return Err(QueueError::Schema(format!(
                "results in '{batch_id}' name batch '{}'",
                results.batch_id
            )));
        }

        let manifest = match fsio::read_json_opt::<Manifest>(&self.manifest_path(batch_id)).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    error = %e,
                    "Manifest unreadable, results not reconciled",
                );
                None
            }
        };
        let expected = manifest.as_ref().map(Manifest::pointer_ids);

        let reconciled = reconcile_results(results, expected.as_ref());
        for violation in &reconciled.violations {
            tracing::warn!(
                batch_id = %batch_id,
                pointer_id = %violation.pointer_id,
                reason = %violation.reason,
                "Result dropped",
            );
        }
        if !reconciled.missing.is_empty() {
            tracing::warn!(
                batch_id = %batch_id,
                missing = reconciled.missing.len(),
                "Results missing for submitted pointers",
            );
        }
        Ok(reconciled)
    }

    /// Mark a batch as discarded and remove its results. Idempotent.
    ///
    /// The marker is written before the results are deleted, so an
    /// interrupted discard still leaves the batch in its terminal state.
    pub async fn discard(&self, batch_id: &str) -> Result<DiscardOutcome, QueueError> {
        validate_identifier("batch", batch_id)?;

        let marked = if self.is_discarded(batch_id).await? {
            false
        } else {
            fsio::create_dir_all(&self.batch_dir(batch_id)).await?;
            let stamp = Utc::now().to_rfc3339();
            fsio::write_atomic(&self.discarded_path(batch_id), stamp.as_bytes()).await?;
            true
        };

        let dir = self.results_dir(batch_id);
        let removed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(QueueError::io(dir, e)),
        };

        if marked || removed {
            tracing::info!(batch_id = %batch_id, results_removed = removed, "Batch discarded");
            Ok(DiscardOutcome::Removed)
        } else {
            tracing::debug!(batch_id = %batch_id, "Batch already discarded");
            Ok(DiscardOutcome::AlreadyAbsent)
        }
    }

    pub async fn batch_state(&self, batch_id: &str) -> Result<BatchState, QueueError> {
        validate_identifier("batch", batch_id)?;

        if self.is_discarded(batch_id).await? {
            return Ok(BatchState::Discarded);
        }
        if fsio::exists(&self.results_path(batch_id)).await? {
            return Ok(BatchState::Processed);
        }
        if fsio::exists(&self.manifest_path(batch_id)).await? {
            return Ok(BatchState::Exported);
        }
        if fsio::exists(&self.batch_dir(batch_id)).await? {
            return Ok(BatchState::Staging);
        }
        Ok(BatchState::Unknown)
    }
}

async fn load_pointer(dir: &Path) -> Result<(PointerMetadata, PathBuf), String> {
    let metadata: PointerMetadata = fsio::read_json_opt(&dir.join(METADATA_FILE_NAME))
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "metadata file missing".to_string())?;
    let image_path = fsio::find_image_file(dir)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "image file missing".to_string())?;
    Ok((metadata, image_path))
}
