use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregate::{AggregatedState, TargetSnapshot};
use crate::export::TargetStatus;
use crate::target::TargetKey;
use crate::worker::WorkerOutcome;

/// A target whose worker task is (or was, until the next poll) running.
pub struct ActiveWorker {
    pub state: Arc<AggregatedState>,
    pub task: JoinHandle<WorkerOutcome>,
}

/// A target whose worker died and is waiting for `restart_at`.
pub struct PendingWorker {
    pub state: Arc<AggregatedState>,
    pub restart_at: Instant,
    /// Whether the "failed, will retry" notice was logged for this death.
    pub notice_emitted: bool,
}

/// Supervisor-owned arena of worker handles, indexed by target identity.
///
/// Every target lives in exactly one of the two maps. Only the supervisor
/// touches the registry; workers never see it.
#[derive(Default)]
pub struct Registry {
    pub(super) active: BTreeMap<TargetKey, ActiveWorker>,
    pub(super) pending: BTreeMap<TargetKey, PendingWorker>,
}

impl Registry {
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn status(&self, key: &TargetKey) -> Option<TargetStatus> {
        if self.active.contains_key(key) {
            Some(TargetStatus::Active)
        } else if self.pending.contains_key(key) {
            Some(TargetStatus::PendingRespawn)
        } else {
            None
        }
    }

    pub fn state(&self, key: &TargetKey) -> Option<&Arc<AggregatedState>> {
        self.active
            .get(key)
            .map(|w| &w.state)
            .or_else(|| self.pending.get(key).map(|w| &w.state))
    }

    /// Keys of active workers whose task has finished.
    pub fn finished(&self) -> Vec<TargetKey> {
        self.active
            .iter()
            .filter(|(_, w)| w.task.is_finished())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys of pending targets due for respawn at `now`.
    pub fn due(&self, now: Instant) -> Vec<TargetKey> {
        self.pending
            .iter()
            .filter(|(_, w)| now >= w.restart_at)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every target with its current status, active ones first.
    pub fn entries(&self) -> Vec<(TargetStatus, Arc<AggregatedState>)> {
        let active = self
            .active
            .values()
            .map(|w| (TargetStatus::Active, Arc::clone(&w.state)));
        let pending = self
            .pending
            .values()
            .map(|w| (TargetStatus::PendingRespawn, Arc::clone(&w.state)));

        active.chain(pending).collect()
    }

    /// Atomic snapshots of every target, active and pending alike.
    pub fn snapshots(&self) -> Vec<(TargetStatus, TargetSnapshot)> {
        snapshot_all(&self.entries())
    }
}

/// Copy of the registry's statuses as of the supervisor's last publish.
///
/// Shared with whoever runs the supervisor, so the counters and statuses
/// can still be exported if the supervisor task is lost.
#[derive(Clone, Default)]
pub struct Ledger(Arc<Mutex<Vec<(TargetStatus, Arc<AggregatedState>)>>>);

impl Ledger {
    pub(super) fn publish(&self, registry: &Registry) {
        *self.0.lock() = registry.entries();
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn status(&self, key: &TargetKey) -> Option<TargetStatus> {
        self.0
            .lock()
            .iter()
            .find(|(_, state)| state.target().key() == key)
            .map(|(status, _)| *status)
    }

    pub fn snapshots(&self) -> Vec<(TargetStatus, TargetSnapshot)> {
        let entries = self.0.lock().clone();
        snapshot_all(&entries)
    }
}

fn snapshot_all(entries: &[(TargetStatus, Arc<AggregatedState>)]) -> Vec<(TargetStatus, TargetSnapshot)> {
    entries
        .iter()
        .map(|(status, state)| (*status, state.snapshot()))
        .collect()
}
