//! Per-queue record owned by the registry

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use loopq_core::{ObserverKey, TaskObserver, TaskQueueId, Wakeable};

use crate::pending::DelayedTaskQueue;

/// Everything the registry tracks for one task queue
///
/// The three collections are locked independently so producers, observer
/// bookkeeping, and wake delivery do not contend with each other. The
/// relationship fields are plain values: they are written only while the
/// registry's structural lock is held exclusively, and read under the
/// shared lock.
pub(crate) struct TaskQueueEntry {
    /// Pending tasks, earliest first
    pub(crate) tasks: Mutex<DelayedTaskQueue>,

    /// Observers in insertion order
    pub(crate) observers: Mutex<IndexMap<ObserverKey, TaskObserver>>,

    /// Wake sink for the driver draining this queue, set at most once
    pub(crate) wakeable: Mutex<Option<Arc<dyn Wakeable>>>,

    /// Queue this one has absorbed, or NONE
    pub(crate) owner_of: TaskQueueId,

    /// Queue that absorbed this one, or NONE
    pub(crate) subsumed_by: TaskQueueId,
}

impl TaskQueueEntry {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(DelayedTaskQueue::new()),
            observers: Mutex::new(IndexMap::new()),
            wakeable: Mutex::new(None),
            owner_of: TaskQueueId::NONE,
            subsumed_by: TaskQueueId::NONE,
        }
    }

    /// True when this queue is currently absorbed by another
    #[inline]
    pub(crate) fn is_subsumed(&self) -> bool {
        self.subsumed_by.is_some()
    }

    /// True when this queue has absorbed another
    #[inline]
    pub(crate) fn is_owner(&self) -> bool {
        self.owner_of.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_unrelated() {
        let entry = TaskQueueEntry::new();
        assert!(!entry.is_subsumed());
        assert!(!entry.is_owner());
        assert!(entry.tasks.lock().is_empty());
        assert!(entry.observers.lock().is_empty());
        assert!(entry.wakeable.lock().is_none());
    }
}
