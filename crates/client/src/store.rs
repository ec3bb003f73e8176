//! Observable progress state for one subject.
//!
//! The push and poll loops both write through [`StatusStore::apply`];
//! subscribers see a new value only when a transition was applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use plansight_core::error::PhaseError;
use plansight_core::items::ItemBoard;
use plansight_core::status::{PhaseState, Transition};
use tokio::sync::watch;

/// Everything a UI needs to render progress for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub subject: String,
    /// Incremented each time processing (re)starts from a settled state.
    /// Background loops exit once the epoch they were started for is gone.
    pub epoch: u64,
    pub phases: BTreeMap<String, PhaseState>,
    pub items: ItemBoard,
    pub push_connected: bool,
    /// Last connectivity problem. Cleared by the next successful poll.
    pub banner: Option<PhaseError>,
}

impl SyncStatus {
    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.get(name)
    }

    pub fn any_processing(&self) -> bool {
        self.phases.values().any(PhaseState::is_processing)
    }

    /// Names of the phases currently `processing`, in name order.
    pub fn processing_phases(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|(_, p)| p.is_processing())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `true` while the loops started for `epoch` should keep running.
    pub fn is_active(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.any_processing()
    }
}

#[derive(Clone)]
pub struct StatusStore {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusStore {
    pub fn new<I, S>(subject: impl Into<String>, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let status = SyncStatus {
            subject: subject.into(),
            epoch: 0,
            phases: phases
                .into_iter()
                .map(|name| (name.into(), PhaseState::default()))
                .collect(),
            items: ItemBoard::new(),
            push_connected: false,
            banner: None,
        };
        let (tx, _) = watch::channel(status);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Run `f` against the current state; watchers are notified only when
    /// it reports [`Transition::Applied`].
    pub fn apply(&self, f: impl FnOnce(&mut SyncStatus) -> Transition) -> Transition {
        let mut outcome = Transition::Unchanged;
        self.tx.send_if_modified(|status| {
            outcome = f(status);
            outcome.is_applied()
        });
        outcome
    }

    /// Read a value out of the current state without cloning all of it.
    pub fn read<R>(&self, f: impl FnOnce(&SyncStatus) -> R) -> R {
        f(&self.tx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use plansight_core::status::ProcessingStatus;

    use super::*;

    #[test]
    fn unchanged_transitions_do_not_notify() {
        let store = StatusStore::new("proj", ["pages"]);
        let mut rx = store.watch();

        let outcome = store.apply(|s| {
            s.phases
                .get_mut("pages")
                .map_or(Transition::Rejected, |p| p.complete())
        });
        assert_eq!(outcome, Transition::Rejected);
        assert!(!rx.has_changed().unwrap());

        let outcome = store.apply(|s| {
            s.phases
                .get_mut("pages")
                .map_or(Transition::Rejected, |p| p.start(Some(4)))
        });
        assert_eq!(outcome, Transition::Applied);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phases["pages"].status, ProcessingStatus::Processing);
    }

    #[test]
    fn activity_is_scoped_to_the_epoch() {
        let store = StatusStore::new("proj", ["pages", "disciplines"]);
        store.apply(|s| {
            s.epoch = 1;
            s.phases.get_mut("pages").map_or(Transition::Rejected, |p| p.start(None))
        });

        let status = store.snapshot();
        assert!(status.is_active(1));
        assert!(!status.is_active(0));
        assert_eq!(status.processing_phases(), vec!["pages".to_string()]);
        assert!(store.read(|s| s.any_processing()));
    }
}
