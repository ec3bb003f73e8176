//! File formats exchanged with the external analysis worker.
//!
//! - [`Manifest`]: `queue/{batchId}/manifest.json`, the completion marker
//!   of an exported batch.
//! - [`PointerMetadata`]: `queue/{batchId}/{sheetId}/{pointerId}/metadata.json`.
//! - [`ResultsFile`]: `results/{batchId}/results.json`, written by the worker.
//!
//! Result records are validated against the submitted pointer set by
//! [`reconcile_results`]: orphan, duplicate and ambiguous records are
//! dropped and reported as [`ProtocolViolation`]s instead of failing the
//! whole batch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BoundingBox, Pointer};
use crate::error::CoreError;
use crate::types::Timestamp;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const RESULTS_FILE_NAME: &str = "results.json";
/// Marker left in `queue/{batchId}/` once the batch has been discarded.
pub const DISCARDED_MARKER_FILE_NAME: &str = "discarded";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub batch_id: String,
    pub exported_at: Timestamp,
    pub sheets: Vec<ManifestSheet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSheet {
    pub sheet_id: String,
    pub file_name: String,
    pub pointer_ids: Vec<String>,
}

impl Manifest {
    /// Build the manifest describing every sheet and pointer of `batch`.
    pub fn from_batch(batch: &Batch, exported_at: Timestamp) -> Self {
        Self {
            batch_id: batch.id.clone(),
            exported_at,
            sheets: batch
                .sheets
                .iter()
                .map(|sheet| ManifestSheet {
                    sheet_id: sheet.id.clone(),
                    file_name: sheet.file_name.clone(),
                    pointer_ids: sheet.pointers.iter().map(|p| p.id.clone()).collect(),
                })
                .collect(),
        }
    }

    /// Every pointer id the manifest promises.
    pub fn pointer_ids(&self) -> HashSet<String> {
        self.sheets
            .iter()
            .flat_map(|s| s.pointer_ids.iter().cloned())
            .collect()
    }

    pub fn pointer_count(&self) -> usize {
        self.sheets.iter().map(|s| s.pointer_ids.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Pointer metadata
// ---------------------------------------------------------------------------

/// Per-pointer metadata file written next to the image payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerMetadata {
    pub id: String,
    pub title: String,
    pub description: String,
    pub page_number: u32,
    pub bounding_box: Option<BoundingBox>,
    pub source_file: String,
}

impl From<&Pointer> for PointerMetadata {
    fn from(pointer: &Pointer) -> Self {
        Self {
            id: pointer.id.clone(),
            title: pointer.title.clone(),
            description: pointer.description.clone(),
            page_number: pointer.page_number,
            bounding_box: pointer.bounding_box,
            source_file: pointer.source_file.clone(),
        }
    }
}

/// Submitted metadata echoed back with a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub source_file: Option<String>,
}

impl From<&Pointer> for OriginalMetadata {
    fn from(pointer: &Pointer) -> Self {
        Self {
            title: Some(pointer.title.clone()),
            description: Some(pointer.description.clone()),
            page_number: Some(pointer.page_number),
            bounding_box: pointer.bounding_box,
            source_file: Some(pointer.source_file.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Terminal artifact produced by the external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsFile {
    pub batch_id: String,
    pub processed_at: Timestamp,
    pub sheets: Vec<ResultsSheet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSheet {
    pub sheet_id: String,
    pub file_name: String,
    #[serde(default)]
    pub pointers: Vec<PointerResultRecord>,
}

impl ResultsFile {
    pub fn pointer_count(&self) -> usize {
        self.sheets.iter().map(|s| s.pointers.len()).sum()
    }

    /// Records carrying an error string rather than an analysis.
    pub fn error_count(&self) -> usize {
        self.sheets
            .iter()
            .flat_map(|s| &s.pointers)
            .filter(|p| p.error.is_some())
            .count()
    }
}

/// Wire form of one pointer result, as found in results files and in
/// `pointer_complete` stream events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerResultRecord {
    pub id: String,
    #[serde(default)]
    pub original_metadata: OriginalMetadata,
    #[serde(default)]
    pub ai_analysis: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Either the analysis payload or the reason it is missing.
#[derive(Debug, Clone, PartialEq)]
pub enum PointerOutcome {
    /// Opaque analysis payload.
    Analysis(serde_json::Value),
    Error(String),
}

/// A validated pointer result: exactly one of analysis or error.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerResult {
    pub id: String,
    pub original_metadata: OriginalMetadata,
    pub outcome: PointerOutcome,
}

impl PointerResult {
    pub fn analysis(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            PointerOutcome::Analysis(value) => Some(value),
            PointerOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            PointerOutcome::Analysis(_) => None,
            PointerOutcome::Error(msg) => Some(msg),
        }
    }
}

impl TryFrom<PointerResultRecord> for PointerResult {
    type Error = CoreError;

    fn try_from(record: PointerResultRecord) -> Result<Self, CoreError> {
        let outcome = match (record.ai_analysis, record.error) {
            (Some(analysis), None) => PointerOutcome::Analysis(analysis),
            (None, Some(error)) => PointerOutcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(CoreError::ProtocolViolation(format!(
                    "Result for pointer '{}' carries both an analysis and an error",
                    record.id
                )))
            }
            (None, None) => {
                return Err(CoreError::ProtocolViolation(format!(
                    "Result for pointer '{}' carries neither an analysis nor an error",
                    record.id
                )))
            }
        };
        Ok(Self {
            id: record.id,
            original_metadata: record.original_metadata,
            outcome,
        })
    }
}

impl From<PointerResult> for PointerResultRecord {
    fn from(result: PointerResult) -> Self {
        let (ai_analysis, error) = match result.outcome {
            PointerOutcome::Analysis(value) => (Some(value), None),
            PointerOutcome::Error(msg) => (None, Some(msg)),
        };
        Self {
            id: result.id,
            original_metadata: result.original_metadata,
            ai_analysis,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// A result record that was dropped because it contradicts the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolViolation {
    pub sheet_id: Option<String>,
    pub pointer_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetResults {
    pub sheet_id: String,
    pub file_name: String,
    pub pointers: Vec<PointerResult>,
}

/// Results file after validation against the submitted pointer set.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledResults {
    pub batch_id: String,
    pub processed_at: Timestamp,
    pub sheets: Vec<SheetResults>,
    /// Dropped records.
    pub violations: Vec<ProtocolViolation>,
    /// Submitted pointer ids with no result record.
    pub missing: Vec<String>,
}

impl ReconciledResults {
    pub fn analyzed_count(&self) -> usize {
        self.pointers().filter(|p| p.analysis().is_some()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.pointers().filter(|p| p.error().is_some()).count()
    }

    pub fn pointers(&self) -> impl Iterator<Item = &PointerResult> {
        self.sheets.iter().flat_map(|s| s.pointers.iter())
    }
}

/// Validate every record of `results`.
///
/// When `expected` is `Some`, records whose id is not in the set are
/// orphans. Duplicate ids keep the first record. Records with both or
/// neither of analysis/error are dropped. Nothing here fails the batch.
pub fn reconcile_results(
    results: ResultsFile,
    expected: Option<&HashSet<String>>,
) -> ReconciledResults {
    let mut seen: HashSet<String> = HashSet::new();
    let mut violations = Vec::new();
    let mut sheets = Vec::with_capacity(results.sheets.len());

    for sheet in results.sheets {
        let mut pointers = Vec::with_capacity(sheet.pointers.len());
        for record in sheet.pointers {
            if let Some(expected) = expected {
                if !expected.contains(&record.id) {
                    violations.push(ProtocolViolation {
                        sheet_id: Some(sheet.sheet_id.clone()),
                        pointer_id: record.id,
                        reason: "result references a pointer that was not submitted".into(),
                    });
                    continue;
                }
            }
            if seen.contains(&record.id) {
                violations.push(ProtocolViolation {
                    sheet_id: Some(sheet.sheet_id.clone()),
                    pointer_id: record.id,
                    reason: "duplicate result for pointer".into(),
                });
                continue;
            }
            let pointer_id = record.id.clone();
            match PointerResult::try_from(record) {
                Ok(result) => {
                    seen.insert(pointer_id);
                    pointers.push(result);
                }
                Err(e) => violations.push(ProtocolViolation {
                    sheet_id: Some(sheet.sheet_id.clone()),
                    pointer_id,
                    reason: e.to_string(),
                }),
            }
        }
        sheets.push(SheetResults {
            sheet_id: sheet.sheet_id,
            file_name: sheet.file_name,
            pointers,
        });
    }

    let mut missing: Vec<String> = expected
        .map(|expected| {
            expected
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    missing.sort();

    ReconciledResults {
        batch_id: results.batch_id,
        processed_at: results.processed_at,
        sheets,
        violations,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::batch::Sheet;

    fn results_json() -> serde_json::Value {
        json!({
            "batchId": "b1",
            "processedAt": "2024-05-01T12:00:00.250000Z",
            "sheets": [{
                "sheetId": "s1",
                "fileName": "A-101.pdf",
                "pointers": [
                    {
                        "id": "p1",
                        "originalMetadata": {"title": "Stair 2", "pageNumber": 3},
                        "aiAnalysis": {"tradeCategory": "Architectural"}
                    },
                    {
                        "id": "p2",
                        "originalMetadata": {},
                        "aiAnalysis": null,
                        "error": "model timeout"
                    }
                ]
            }]
        })
    }

    fn expected(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn results_file_parses_python_timestamps() {
        let file: ResultsFile = serde_json::from_value(results_json()).unwrap();
        assert_eq!(file.batch_id, "b1");
        assert_eq!(file.pointer_count(), 2);
        assert_eq!(file.error_count(), 1);
    }

    #[test]
    fn record_with_both_outcomes_is_a_violation() {
        let record = PointerResultRecord {
            id: "p1".into(),
            original_metadata: OriginalMetadata::default(),
            ai_analysis: Some(json!({})),
            error: Some("boom".into()),
        };
        assert_matches!(
            PointerResult::try_from(record),
            Err(CoreError::ProtocolViolation(_))
        );
    }

    #[test]
    fn record_with_neither_outcome_is_a_violation() {
        let record = PointerResultRecord {
            id: "p1".into(),
            original_metadata: OriginalMetadata::default(),
            ai_analysis: None,
            error: None,
        };
        assert!(PointerResult::try_from(record).is_err());
    }

    #[test]
    fn reconcile_keeps_known_pointers() {
        let file: ResultsFile = serde_json::from_value(results_json()).unwrap();
        let reconciled = reconcile_results(file, Some(&expected(&["p1", "p2"])));

        assert!(reconciled.violations.is_empty());
        assert!(reconciled.missing.is_empty());
        assert_eq!(reconciled.analyzed_count(), 1);
        assert_eq!(reconciled.failed_count(), 1);
    }

    #[test]
    fn reconcile_drops_orphans_without_touching_counts() {
        let mut value = results_json();
        value["sheets"][0]["pointers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "ghost", "aiAnalysis": {"x": 1}}));
        let file: ResultsFile = serde_json::from_value(value).unwrap();

        let reconciled = reconcile_results(file, Some(&expected(&["p1", "p2"])));

        assert_eq!(reconciled.violations.len(), 1);
        assert_eq!(reconciled.violations[0].pointer_id, "ghost");
        assert_eq!(reconciled.analyzed_count(), 1);
        assert_eq!(reconciled.pointers().count(), 2);
    }

    #[test]
    fn reconcile_reports_missing_and_duplicates() {
        let mut value = results_json();
        value["sheets"][0]["pointers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "p1", "aiAnalysis": {"again": true}}));
        let file: ResultsFile = serde_json::from_value(value).unwrap();

        let reconciled = reconcile_results(file, Some(&expected(&["p1", "p2", "p3"])));

        assert_eq!(reconciled.missing, vec!["p3".to_string()]);
        assert_eq!(reconciled.violations.len(), 1);
        assert!(reconciled.violations[0].reason.contains("duplicate"));
    }

    #[test]
    fn reconcile_without_expected_set_accepts_all_ids() {
        let file: ResultsFile = serde_json::from_value(results_json()).unwrap();
        let reconciled = reconcile_results(file, None);
        assert_eq!(reconciled.pointers().count(), 2);
        assert!(reconciled.missing.is_empty());
    }

    #[test]
    fn manifest_lists_every_pointer() {
        let batch = Batch::new(
            "b1",
            vec![Sheet {
                id: "s1".into(),
                file_name: "A-101.pdf".into(),
                pointers: vec![Pointer {
                    id: "p1".into(),
                    image: vec![1, 2, 3],
                    title: "t".into(),
                    description: "d".into(),
                    page_number: 2,
                    source_file: "A-101.pdf".into(),
                    bounding_box: None,
                }],
            }],
        );
        let manifest = Manifest::from_batch(&batch, chrono::Utc::now());
        let value = serde_json::to_value(&manifest).unwrap();

        assert_eq!(value["batchId"], "b1");
        assert_eq!(value["sheets"][0]["pointerIds"][0], "p1");
        assert_eq!(manifest.pointer_count(), 1);
    }

    #[test]
    fn pointer_metadata_writes_null_bounding_box() {
        let metadata = PointerMetadata {
            id: "p1".into(),
            title: "t".into(),
            description: "d".into(),
            page_number: 1,
            bounding_box: None,
            source_file: "f.pdf".into(),
        };
        let value = serde_json::to_value(metadata).unwrap();
        assert!(value["boundingBox"].is_null());
        assert_eq!(value["pageNumber"], 1);
    }
}
