//! Per-item status tracking with dependencies.
//!
//! Fine-grained entities (pages, disciplines) move through
//! `waiting -> ready -> processing -> complete`. An item is `waiting`
//! while any declared dependency is not yet `complete`; completing the
//! last dependency promotes it to `ready`. Nothing here is time-driven:
//! every change comes from an event or a poll.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::{ProcessingStatus, Transition};

pub const ITEM_WAITING: &str = "waiting";
pub const ITEM_READY: &str = "ready";
pub const ITEM_PROCESSING: &str = "processing";
pub const ITEM_COMPLETE: &str = "complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Waiting,
    Ready,
    Processing,
    Complete,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => ITEM_WAITING,
            Self::Ready => ITEM_READY,
            Self::Processing => ITEM_PROCESSING,
            Self::Complete => ITEM_COMPLETE,
        }
    }

    pub fn from_str_value(s: &str) -> Result<Self, CoreError> {
        match s {
            ITEM_WAITING => Ok(Self::Waiting),
            ITEM_READY => Ok(Self::Ready),
            ITEM_PROCESSING => Ok(Self::Processing),
            ITEM_COMPLETE => Ok(Self::Complete),
            other => Err(CoreError::Validation(format!(
                "Invalid item status '{other}'"
            ))),
        }
    }
}

/// Identifies one item, e.g. `("page", "f1:3")` or `("discipline", "A")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub kind: String,
    pub id: String,
}

impl ItemKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ItemEntry {
    status: ItemStatus,
    dependencies: BTreeSet<ItemKey>,
}

/// Tally of item statuses for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub total: u64,
    pub waiting: u64,
    pub ready: u64,
    pub processing: u64,
    pub complete: u64,
}

/// All tracked items and their dependency edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemBoard {
    items: BTreeMap<ItemKey, ItemEntry>,
}

impl ItemBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Register an item if unknown. New items without dependencies are
    /// immediately `ready`.
    pub fn insert(&mut self, key: ItemKey) -> ItemStatus {
        self.items
            .entry(key)
            .or_insert_with(|| ItemEntry {
                status: ItemStatus::Ready,
                dependencies: BTreeSet::new(),
            })
            .status
    }

    pub fn status(&self, key: &ItemKey) -> Option<ItemStatus> {
        self.items.get(key).map(|e| e.status)
    }

    /// Declare that `item` depends on `dependency`. A `ready` item with a
    /// new unmet dependency goes back to `waiting`.
    pub fn add_dependency(&mut self, item: ItemKey, dependency: ItemKey) {
        self.insert(dependency.clone());
        self.insert(item.clone());

        let dependency_complete = self.status(&dependency) == Some(ItemStatus::Complete);
        if let Some(entry) = self.items.get_mut(&item) {
            entry.dependencies.insert(dependency);
            if entry.status == ItemStatus::Ready && !dependency_complete {
                entry.status = ItemStatus::Waiting;
            }
        }
    }

    /// `true` when every known dependency of `key` is `complete`.
    pub fn dependencies_met(&self, key: &ItemKey) -> bool {
        self.items.get(key).map_or(true, |entry| {
            entry
                .dependencies
                .iter()
                .all(|dep| self.status(dep) == Some(ItemStatus::Complete))
        })
    }

    /// `waiting -> ready`, only once dependencies are met. Late `ready`
    /// reports for items already further along are ignored.
    pub fn mark_ready(&mut self, key: &ItemKey) -> Transition {
        self.insert(key.clone());
        let met = self.dependencies_met(key);
        let Some(entry) = self.items.get_mut(key) else {
            return Transition::Rejected;
        };
        match entry.status {
            ItemStatus::Waiting if met => {
                entry.status = ItemStatus::Ready;
                Transition::Applied
            }
            ItemStatus::Waiting => Transition::Rejected,
            ItemStatus::Ready | ItemStatus::Processing | ItemStatus::Complete => {
                Transition::Unchanged
            }
        }
    }

    /// `ready -> processing`.
    pub fn mark_processing(&mut self, key: &ItemKey) -> Transition {
        self.insert(key.clone());
        let Some(entry) = self.items.get_mut(key) else {
            return Transition::Rejected;
        };
        match entry.status {
            ItemStatus::Ready => {
                entry.status = ItemStatus::Processing;
                Transition::Applied
            }
            ItemStatus::Waiting => Transition::Rejected,
            ItemStatus::Processing | ItemStatus::Complete => Transition::Unchanged,
        }
    }

    /// `ready | processing -> complete`. Returns the dependents that became
    /// `ready` as a consequence.
    pub fn mark_complete(&mut self, key: &ItemKey) -> (Transition, Vec<ItemKey>) {
        self.insert(key.clone());
        let Some(entry) = self.items.get_mut(key) else {
            return (Transition::Rejected, Vec::new());
        };
        match entry.status {
            ItemStatus::Complete => return (Transition::Unchanged, Vec::new()),
            ItemStatus::Waiting => return (Transition::Rejected, Vec::new()),
            ItemStatus::Ready | ItemStatus::Processing => entry.status = ItemStatus::Complete,
        }

        let dependents: Vec<ItemKey> = self
            .items
            .iter()
            .filter(|(_, e)| e.status == ItemStatus::Waiting && e.dependencies.contains(key))
            .map(|(k, _)| k.clone())
            .collect();

        let mut promoted = Vec::new();
        for dependent in dependents {
            if self.dependencies_met(&dependent) {
                if let Some(entry) = self.items.get_mut(&dependent) {
                    entry.status = ItemStatus::Ready;
                    promoted.push(dependent);
                }
            }
        }

        (Transition::Applied, promoted)
    }

    /// Send every item back to the start (re-processing after new
    /// annotations): items with dependencies wait, the rest are ready.
    pub fn reset(&mut self) {
        for entry in self.items.values_mut() {
            entry.status = if entry.dependencies.is_empty() {
                ItemStatus::Ready
            } else {
                ItemStatus::Waiting
            };
        }
    }

    /// Items of one kind in key order.
    pub fn items_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a ItemKey, ItemStatus)> + 'a {
        self.items
            .iter()
            .filter(move |(k, _)| k.kind == kind)
            .map(|(k, e)| (k, e.status))
    }

    pub fn counts(&self, kind: &str) -> ItemCounts {
        let mut counts = ItemCounts::default();
        for (_, status) in self.items_of_kind(kind) {
            counts.total += 1;
            match status {
                ItemStatus::Waiting => counts.waiting += 1,
                ItemStatus::Ready => counts.ready += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Complete => counts.complete += 1,
            }
        }
        counts
    }
}

/// Derive a coarse phase status from item counts, the same way the
/// analysis server reports it.
pub fn derive_phase_status(counts: &ItemCounts, job_running: bool) -> ProcessingStatus {
    if job_running {
        return ProcessingStatus::Processing;
    }
    if counts.total == 0 {
        return ProcessingStatus::Idle;
    }
    if counts.complete == counts.total {
        return ProcessingStatus::Complete;
    }
    if counts.processing > 0 {
        return ProcessingStatus::Processing;
    }
    ProcessingStatus::Idle
}
