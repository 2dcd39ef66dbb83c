//! Progress watcher: the single serialized entry point for batch state.
//!
//! Workers never touch [`BatchState`] directly. Every mutation goes through
//! one short critical section on the watcher's lock and returns the
//! post-mutation snapshot, so aggregate counters always agree with the
//! per-item statuses.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Terminal (or not yet terminal) status of one item.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

/// Aggregate progress and outcome counters for one batch.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BatchState {
    pub total_items: usize,
    /// Known only when every item's size was known up front.
    pub total_bytes: Option<u64>,
    pub completed_items: usize,
    pub completed_bytes: u64,
    pub failed_items: usize,
    pub cancelled_items: usize,
    /// Once true, stays true.
    pub cancelled: bool,
    pub statuses: Vec<ItemStatus>,
    /// Incremented by every mutation; lets consumers drop stale snapshots.
    pub revision: u64,
}

impl BatchState {
    pub fn new(total_items: usize, total_bytes: Option<u64>) -> Self {
        Self {
            total_items,
            total_bytes,
            completed_items: 0,
            completed_bytes: 0,
            failed_items: 0,
            cancelled_items: 0,
            cancelled: false,
            statuses: vec![ItemStatus::Pending; total_items],
            revision: 0,
        }
    }

    pub fn pending_items(&self) -> usize {
        self.total_items - self.completed_items - self.failed_items - self.cancelled_items
    }

    pub fn is_finished(&self) -> bool {
        self.pending_items() == 0
    }

    /// Indices of items that ended in failure.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, status)| matches!(status, ItemStatus::Failed(_)))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Apply a terminal status. Returns false when the item was already
    /// terminal (or out of range), leaving the state untouched.
    fn settle(&mut self, index: usize, status: ItemStatus) -> bool {
        let Some(slot) = self.statuses.get_mut(index) else {
            return false;
        };
        if slot.is_terminal() {
            return false;
        }
        match &status {
            ItemStatus::Succeeded => self.completed_items += 1,
            ItemStatus::Failed(_) => self.failed_items += 1,
            ItemStatus::Cancelled => self.cancelled_items += 1,
            ItemStatus::Pending => return false,
        }
        *slot = status;
        self.revision += 1;
        true
    }
}

/// Thread-safe owner of a batch's [`BatchState`] and cancellation flag.
#[derive(Debug)]
pub struct ProgressWatcher {
    state: Mutex<BatchState>,
    cancel: CancellationToken,
}

impl ProgressWatcher {
    pub fn new(total_items: usize, total_bytes: Option<u64>) -> Self {
        Self {
            state: Mutex::new(BatchState::new(total_items, total_bytes)),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BatchState {
        self.lock().clone()
    }

    pub fn record_completion(&self, index: usize, bytes: u64) -> Option<BatchState> {
        let mut state = self.lock();
        if state.settle(index, ItemStatus::Succeeded) {
            state.completed_bytes += bytes;
            Some(state.clone())
        } else {
            None
        }
    }

    pub fn record_failure(&self, index: usize, reason: impl Into<String>) -> Option<BatchState> {
        let mut state = self.lock();
        state
            .settle(index, ItemStatus::Failed(reason.into()))
            .then(|| state.clone())
    }

    pub fn record_cancelled(&self, index: usize) -> Option<BatchState> {
        let mut state = self.lock();
        state
            .settle(index, ItemStatus::Cancelled)
            .then(|| state.clone())
    }

    /// Mark every still-pending item as cancelled; returns their indices.
    pub fn cancel_pending(&self) -> Vec<usize> {
        let mut state = self.lock();
        let pending: Vec<usize> = state
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(idx, _)| idx)
            .collect();
        for &idx in &pending {
            state.settle(idx, ItemStatus::Cancelled);
        }
        pending
    }

    /// Request cancellation. Idempotent; the flag never reverts.
    pub fn cancel(&self) {
        {
            let mut state = self.lock();
            if !state.cancelled {
                state.cancelled = true;
                state.revision += 1;
            }
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when [`cancel`](Self::cancel) is called.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
