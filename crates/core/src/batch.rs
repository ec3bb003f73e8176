//! Batch submission model and validation.
//!
//! A [`Batch`] is an immutable, caller-identified unit of work made of
//! ordered [`Sheet`]s, each holding ordered [`Pointer`]s. Identifiers are
//! used verbatim as directory names by the queue protocol, so they are
//! validated as safe path segments here.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on a single pointer's raw image payload (20 MiB).
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Maximum length of a batch, sheet or pointer identifier.
pub const MAX_ID_LENGTH: usize = 128;

/// Tolerance for `x + w <= 1` style checks on normalized floats.
const BOUNDS_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Batch lifecycle
// ---------------------------------------------------------------------------

pub const BATCH_STATUS_PENDING: &str = "pending";
pub const BATCH_STATUS_EXPORTED: &str = "exported";
pub const BATCH_STATUS_PROCESSED: &str = "processed";
pub const BATCH_STATUS_DISCARDED: &str = "discarded";

/// Lifecycle of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Exported,
    Processed,
    Discarded,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => BATCH_STATUS_PENDING,
            Self::Exported => BATCH_STATUS_EXPORTED,
            Self::Processed => BATCH_STATUS_PROCESSED,
            Self::Discarded => BATCH_STATUS_DISCARDED,
        }
    }

    /// Parse the string form used in status payloads.
    pub fn from_str_value(s: &str) -> Result<Self, CoreError> {
        match s {
            BATCH_STATUS_PENDING => Ok(Self::Pending),
            BATCH_STATUS_EXPORTED => Ok(Self::Exported),
            BATCH_STATUS_PROCESSED => Ok(Self::Processed),
            BATCH_STATUS_DISCARDED => Ok(Self::Discarded),
            other => Err(CoreError::Validation(format!(
                "Invalid batch status '{other}'"
            ))),
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Normalized region of a page, every value in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x_norm: f64,
    pub y_norm: f64,
    pub w_norm: f64,
    pub h_norm: f64,
}

impl BoundingBox {
    pub fn new(x_norm: f64, y_norm: f64, w_norm: f64, h_norm: f64) -> Self {
        Self {
            x_norm,
            y_norm,
            w_norm,
            h_norm,
        }
    }

    /// Check ranges and that the box stays inside the page.
    pub fn validate(&self) -> Result<(), CoreError> {
        let fields = [
            ("xNorm", self.x_norm),
            ("yNorm", self.y_norm),
            ("wNorm", self.w_norm),
            ("hNorm", self.h_norm),
        ];
        for (name, value) in fields {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Validation(format!(
                    "Bounding box {name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.x_norm + self.w_norm > 1.0 + BOUNDS_EPSILON {
            return Err(CoreError::Validation(format!(
                "Bounding box exceeds page width (x + w = {})",
                self.x_norm + self.w_norm
            )));
        }
        if self.y_norm + self.h_norm > 1.0 + BOUNDS_EPSILON {
            return Err(CoreError::Validation(format!(
                "Bounding box exceeds page height (y + h = {})",
                self.y_norm + self.h_norm
            )));
        }
        Ok(())
    }
}

/// An annotated image region awaiting analysis.
#[derive(Clone, PartialEq)]
pub struct Pointer {
    pub id: String,
    /// Raw image bytes (PNG/JPEG/WebP expected, not enforced).
    pub image: Vec<u8>,
    pub title: String,
    pub description: String,
    /// 1-based page number within the source document.
    pub page_number: u32,
    pub source_file: String,
    pub bounding_box: Option<BoundingBox>,
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("id", &self.id)
            .field("image_bytes", &self.image.len())
            .field("title", &self.title)
            .field("page_number", &self.page_number)
            .field("source_file", &self.source_file)
            .field("bounding_box", &self.bounding_box)
            .finish()
    }
}

/// A document sheet and the pointers drawn on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub id: String,
    pub file_name: String,
    pub pointers: Vec<Pointer>,
}

/// A unit of work submitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: String,
    pub sheets: Vec<Sheet>,
}

impl Batch {
    pub fn new(id: impl Into<String>, sheets: Vec<Sheet>) -> Self {
        Self {
            id: id.into(),
            sheets,
        }
    }

    /// Total number of pointers across all sheets.
    pub fn pointer_count(&self) -> usize {
        self.sheets.iter().map(|s| s.pointers.len()).sum()
    }

    /// Pointer ids in submission order.
    pub fn pointer_ids(&self) -> Vec<&str> {
        self.sheets
            .iter()
            .flat_map(|s| s.pointers.iter().map(|p| p.id.as_str()))
            .collect()
    }

    /// Validate identifiers, uniqueness, payload sizes and bounding boxes.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_identifier("batch", &self.id)?;

        let mut sheet_ids = HashSet::new();
        let mut pointer_ids = HashSet::new();

        for sheet in &self.sheets {
            validate_identifier("sheet", &sheet.id)?;
            if !sheet_ids.insert(sheet.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate sheet id '{}' in batch '{}'",
                    sheet.id, self.id
                )));
            }

            for pointer in &sheet.pointers {
                validate_pointer(pointer)?;
                if !pointer_ids.insert(pointer.id.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "Duplicate pointer id '{}' in batch '{}'",
                        pointer.id, self.id
                    )));
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Ensure an identifier can be used as a single directory name.
pub fn validate_identifier(kind: &str, id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(format!("{kind} id must not be empty")));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(CoreError::Validation(format!(
            "{kind} id exceeds {MAX_ID_LENGTH} bytes"
        )));
    }
    if id == "." || id == ".." || id.contains("..") {
        return Err(CoreError::Validation(format!(
            "{kind} id '{id}' must not contain '..'"
        )));
    }
    if id
        .chars()
        .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
    {
        return Err(CoreError::Validation(format!(
            "{kind} id '{id}' contains a path separator or control character"
        )));
    }
    Ok(())
}

/// Validate a single pointer's fields.
pub fn validate_pointer(pointer: &Pointer) -> Result<(), CoreError> {
    validate_identifier("pointer", &pointer.id)?;

    if pointer.page_number < 1 {
        return Err(CoreError::Validation(format!(
            "Pointer '{}' page number must be >= 1",
            pointer.id
        )));
    }
    if pointer.image.len() > MAX_IMAGE_BYTES {
        return Err(CoreError::Validation(format!(
            "Pointer '{}' image is {} bytes, limit is {MAX_IMAGE_BYTES}",
            pointer.id,
            pointer.image.len()
        )));
    }
    if let Some(bbox) = &pointer.bounding_box {
        bbox.validate().map_err(|e| match e {
            CoreError::Validation(msg) => {
                CoreError::Validation(format!("Pointer '{}': {msg}", pointer.id))
            }
            other => other,
        })?;
    }
    Ok(())
}
