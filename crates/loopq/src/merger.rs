//! QueueMerger - lease-based merge control for a queue pair
//!
//! A raw `merge` glues two queues together until someone calls `unmerge`.
//! Drivers usually want something softer: merge for the next N turns and
//! fall apart on their own once the borrowing side stops renewing. The
//! merger wraps the registry's merge and unmerge in a lease counter that
//! the owning driver decrements once per turn.
//!
//! Mergers built for the same ordered (owner, subsumed) pair share their
//! lease state through the registry, so any of them can observe, extend,
//! or tear down the merge. An unmerge-now request only takes effect once
//! every merger that merged (or recorded itself) has asked for it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use loopq_core::TaskQueueId;

use crate::registry::TaskQueueRegistry;

/// Outcome of a `decrement_lease` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerStatus {
    /// The pair was not merged; nothing changed
    RemainsUnmerged,
    /// The pair is still merged after this call
    RemainsMerged,
    /// This call unmerged the pair
    UnmergedNow,
}

/// Lease state shared by every merger of one ordered queue pair
pub(crate) struct MergerState {
    inner: Mutex<MergerInner>,
    merged_condition: Condvar,
}

struct MergerInner {
    /// Turns left before the merge lapses; 0 means not merged
    lease_term: usize,
    /// While false, merges and unmerges are suppressed
    enabled: bool,
    /// Mergers that merged or recorded themselves and have not yet
    /// asked to unmerge
    merge_callers: HashSet<u64>,
}

impl MergerState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MergerInner {
                lease_term: 0,
                enabled: true,
                merge_callers: HashSet::new(),
            }),
            merged_condition: Condvar::new(),
        }
    }
}

/// Merges one queue into another for a bounded number of turns
///
/// A merger is built for an (owner, subsumed) pair. `merge_with_lease`
/// performs the registry merge and arms a countdown; the owner's driver
/// calls `decrement_lease` once per turn, and when the count hits zero
/// the pair unmerges by itself. Holders that need the merge to outlive
/// the current lease extend it instead of re-merging.
///
/// A merger whose two ids are the same queue is statically merged:
/// `is_merged` is always true and every transition is a no-op.
///
/// # Example
///
/// ```
/// use loopq::{QueueMerger, TaskQueueRegistry};
/// use std::sync::Arc;
///
/// let registry = Arc::new(TaskQueueRegistry::new());
/// let ui = registry.create_task_queue();
/// let render = registry.create_task_queue();
///
/// let merger = QueueMerger::new(Arc::clone(&registry), ui, render);
/// merger.merge_with_lease(2);
/// assert!(merger.is_merged());
///
/// merger.decrement_lease();
/// merger.decrement_lease();
/// assert!(!merger.is_merged());
/// ```
pub struct QueueMerger {
    registry: Arc<TaskQueueRegistry>,
    owner: TaskQueueId,
    subsumed: TaskQueueId,
    /// Identifies this merger in the shared caller set
    caller_id: u64,
    state: Arc<MergerState>,
    merge_unmerge_callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl QueueMerger {
    /// Build a merger that merges `subsumed` into `owner`
    ///
    /// Both queues must outlive the merger's merged spans; the queues
    /// themselves are not created or disposed here.
    pub fn new(
        registry: Arc<TaskQueueRegistry>,
        owner: TaskQueueId,
        subsumed: TaskQueueId,
    ) -> Self {
        static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);
        let state = registry.merger_state(owner, subsumed);
        Self {
            registry,
            owner,
            subsumed,
            caller_id: NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed),
            state,
            merge_unmerge_callback: Mutex::new(None),
        }
    }

    /// The queue that absorbs the other while merged
    #[inline]
    pub fn owner(&self) -> TaskQueueId {
        self.owner
    }

    /// The queue that is absorbed while merged
    #[inline]
    pub fn subsumed(&self) -> TaskQueueId {
        self.subsumed
    }

    /// Merge the pair and set the lease to `lease_term` turns
    ///
    /// Suppressed while disabled. If the pair is already merged the
    /// caller is recorded but the lease is left alone; use
    /// `extend_lease_to` to lengthen it.
    ///
    /// # Panics
    ///
    /// Panics if `lease_term` is 0, or if the registry refuses the merge
    /// because one of the queues is already in another merge.
    pub fn merge_with_lease(&self, lease_term: usize) {
        if self.statically_merged() {
            return;
        }
        assert!(lease_term > 0, "lease term must be positive");

        let mut inner = self.state.inner.lock();
        if inner.lease_term > 0 {
            inner.merge_callers.insert(self.caller_id);
            self.state.merged_condition.notify_all();
            return;
        }
        if !inner.enabled {
            return;
        }

        let success = self.registry.merge(self.owner, self.subsumed);
        assert!(
            success,
            "cannot merge task queues {} and {}; one is already in another merge",
            self.owner, self.subsumed
        );
        inner.lease_term = lease_term;
        inner.merge_callers.insert(self.caller_id);
        self.state.merged_condition.notify_all();
        drop(inner);

        debug!(owner = %self.owner, subsumed = %self.subsumed, lease_term, "merged with lease");
        self.run_merge_unmerge_callback();
    }

    /// Burn one turn of the lease, unmerging when it reaches zero
    ///
    /// Does nothing while the pair is unmerged or the merger is
    /// disabled; a disabled merger keeps the remaining lease intact.
    pub fn decrement_lease(&self) -> MergerStatus {
        if self.statically_merged() {
            return MergerStatus::RemainsMerged;
        }

        let mut inner = self.state.inner.lock();
        if inner.lease_term == 0 {
            return MergerStatus::RemainsUnmerged;
        }
        if !inner.enabled {
            return MergerStatus::RemainsMerged;
        }

        inner.lease_term -= 1;
        if inner.lease_term > 0 {
            return MergerStatus::RemainsMerged;
        }

        self.unmerge_locked(&mut inner);
        drop(inner);

        debug!(owner = %self.owner, subsumed = %self.subsumed, "lease expired, unmerged");
        self.run_merge_unmerge_callback();
        MergerStatus::UnmergedNow
    }

    /// Raise the lease to `lease_term` turns if it is currently lower
    ///
    /// The caller is recorded as holding the merge. A lease is never
    /// shortened this way.
    pub fn extend_lease_to(&self, lease_term: usize) {
        if self.statically_merged() {
            return;
        }
        assert!(lease_term > 0, "lease term must be positive");

        let mut inner = self.state.inner.lock();
        debug_assert!(inner.lease_term > 0, "extending the lease of an unmerged pair");
        inner.merge_callers.insert(self.caller_id);
        if lease_term > inner.lease_term {
            inner.lease_term = lease_term;
        }
    }

    /// Withdraw this merger from the merge, unmerging if it was the
    /// last holder
    ///
    /// While other callers still hold the merge, or the merger is
    /// disabled, the pair stays merged.
    pub fn unmerge_now_if_last(&self) {
        if self.statically_merged() {
            return;
        }

        let mut inner = self.state.inner.lock();
        inner.merge_callers.remove(&self.caller_id);
        if !inner.merge_callers.is_empty() {
            return;
        }
        if inner.lease_term == 0 || !inner.enabled {
            return;
        }

        self.unmerge_locked(&mut inner);
        drop(inner);

        debug!(owner = %self.owner, subsumed = %self.subsumed, "last caller unmerged");
        self.run_merge_unmerge_callback();
    }

    /// Record this merger as a holder of the merge without merging
    ///
    /// Lets a merger that did not initiate the merge keep it alive
    /// against `unmerge_now_if_last` from the others.
    pub fn record_merge_caller(&self) {
        if self.statically_merged() {
            return;
        }
        self.state.inner.lock().merge_callers.insert(self.caller_id);
    }

    /// True while the pair is merged (always true for a same-queue pair)
    pub fn is_merged(&self) -> bool {
        if self.statically_merged() {
            return true;
        }
        self.state.inner.lock().lease_term > 0
    }

    /// Block until some merger of this pair merges it
    ///
    /// Returns immediately when already merged.
    pub fn wait_until_merged(&self) {
        if self.statically_merged() {
            return;
        }
        let mut inner = self.state.inner.lock();
        self.state
            .merged_condition
            .wait_while(&mut inner, |inner| inner.lease_term == 0);
    }

    /// Allow merges and unmerges again
    pub fn enable(&self) {
        self.state.inner.lock().enabled = true;
    }

    /// Freeze the current state: merges and unmerges become no-ops
    pub fn disable(&self) {
        self.state.inner.lock().enabled = false;
    }

    /// False while merges and unmerges are suppressed
    pub fn is_enabled(&self) -> bool {
        self.state.inner.lock().enabled
    }

    /// Install a callback that runs after every merge and unmerge this
    /// merger performs
    ///
    /// The callback runs with no merger or registry locks held.
    pub fn set_merge_unmerge_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.merge_unmerge_callback.lock() = Some(Arc::new(callback));
    }

    #[inline]
    fn statically_merged(&self) -> bool {
        self.owner == self.subsumed
    }

    /// Unmerge through the registry and reset the shared state
    fn unmerge_locked(&self, inner: &mut MergerInner) {
        let success = self.registry.unmerge(self.owner);
        assert!(
            success,
            "task queues {} and {} were merged but could not unmerge",
            self.owner, self.subsumed
        );
        inner.lease_term = 0;
        inner.merge_callers.clear();
    }

    fn run_merge_unmerge_callback(&self) {
        let callback = self.merge_unmerge_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for QueueMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMerger")
            .field("owner", &self.owner)
            .field("subsumed", &self.subsumed)
            .field("merged", &self.is_merged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn pair(registry: &Arc<TaskQueueRegistry>) -> (TaskQueueId, TaskQueueId) {
        (registry.create_task_queue(), registry.create_task_queue())
    }

    #[test]
    fn test_remains_merged_until_lease_expires() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(Arc::clone(&registry), owner, subsumed);
        const LEASE: usize = 5;

        assert!(!merger.is_merged());
        merger.merge_with_lease(LEASE);
        assert!(registry.owns(owner, subsumed));

        for turn in 0..LEASE {
            assert!(merger.is_merged());
            let status = merger.decrement_lease();
            if turn + 1 < LEASE {
                assert_eq!(status, MergerStatus::RemainsMerged);
            } else {
                assert_eq!(status, MergerStatus::UnmergedNow);
            }
        }

        assert!(!merger.is_merged());
        assert!(!registry.owns(owner, subsumed));
    }

    #[test]
    fn test_decrement_when_unmerged_is_noop() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        assert_eq!(merger.decrement_lease(), MergerStatus::RemainsUnmerged);
        assert!(!merger.is_merged());
    }

    #[test]
    fn test_lease_extension() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);
        const LEASE: usize = 5;

        merger.merge_with_lease(LEASE);

        // Leave one turn on the lease.
        for _ in 0..LEASE - 1 {
            assert!(merger.is_merged());
            merger.decrement_lease();
        }

        // The extension sets the remaining term, it does not add to it.
        merger.extend_lease_to(LEASE);
        for _ in 0..LEASE {
            assert!(merger.is_merged());
            merger.decrement_lease();
        }

        assert!(!merger.is_merged());
    }

    #[test]
    fn test_extend_never_shortens_lease() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        merger.merge_with_lease(5);
        merger.extend_lease_to(2);

        for _ in 0..4 {
            merger.decrement_lease();
            assert!(merger.is_merged());
        }
        assert_eq!(merger.decrement_lease(), MergerStatus::UnmergedNow);
    }

    #[test]
    fn test_same_queue_pair_is_statically_merged() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let queue = registry.create_task_queue();
        let merger = QueueMerger::new(registry, queue, queue);

        assert!(merger.is_merged());

        // Lease bookkeeping and unmerges are all no-ops.
        merger.merge_with_lease(5);
        for _ in 0..5 {
            assert_eq!(merger.decrement_lease(), MergerStatus::RemainsMerged);
            assert!(merger.is_merged());
        }
        merger.unmerge_now_if_last();
        assert!(merger.is_merged());

        // And waiting returns immediately.
        merger.wait_until_merged();
        assert!(merger.is_merged());
    }

    #[test]
    fn test_merge_is_suppressed_while_disabled() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        merger.disable();
        merger.merge_with_lease(1);
        assert!(!merger.is_merged());

        // Re-enabling does not merge by itself.
        merger.enable();
        assert!(!merger.is_merged());

        merger.merge_with_lease(1);
        assert!(merger.is_merged());

        assert_eq!(merger.decrement_lease(), MergerStatus::UnmergedNow);
        assert!(!merger.is_merged());
    }

    #[test]
    fn test_unmerge_is_suppressed_while_disabled() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        merger.enable();
        merger.merge_with_lease(1);
        assert!(merger.is_merged());

        // Neither path may unmerge while disabled, and the lease
        // survives untouched.
        merger.disable();
        merger.unmerge_now_if_last();
        assert!(merger.is_merged());
        assert_eq!(merger.decrement_lease(), MergerStatus::RemainsMerged);
        assert!(merger.is_merged());

        merger.enable();
        merger.unmerge_now_if_last();
        assert!(!merger.is_merged());

        merger.merge_with_lease(1);
        assert!(merger.is_merged());
        assert_eq!(merger.decrement_lease(), MergerStatus::UnmergedNow);
        assert!(!merger.is_merged());
    }

    #[test]
    fn test_is_enabled_tracks_enable_disable() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        assert!(merger.is_enabled());
        merger.disable();
        assert!(!merger.is_enabled());
        merger.enable();
        assert!(merger.is_enabled());
    }

    #[test]
    fn test_callback_fires_on_merge_and_unmerge() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = QueueMerger::new(registry, owner, subsumed);

        let callbacks = Arc::new(AtomicUsize::new(0));
        {
            let callbacks = Arc::clone(&callbacks);
            merger.set_merge_unmerge_callback(move || {
                callbacks.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(callbacks.load(Ordering::SeqCst), 0);

        merger.merge_with_lease(2);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        // Re-merging an already merged pair is not a transition.
        merger.merge_with_lease(2);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        assert_eq!(merger.decrement_lease(), MergerStatus::RemainsMerged);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        assert_eq!(merger.decrement_lease(), MergerStatus::UnmergedNow);
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mergers_share_lease_for_same_pair() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger1 = QueueMerger::new(Arc::clone(&registry), owner, subsumed);
        let merger2 = QueueMerger::new(Arc::clone(&registry), owner, subsumed);
        const LEASE: usize = 5;

        assert!(!merger1.is_merged());
        assert!(!merger2.is_merged());

        // Merge through the second, drive the lease through the first.
        merger2.merge_with_lease(LEASE);
        for _ in 0..LEASE - 1 {
            assert!(merger1.is_merged());
            merger1.decrement_lease();
        }

        merger1.extend_lease_to(LEASE);
        for _ in 0..LEASE {
            assert!(merger2.is_merged());
            merger2.decrement_lease();
        }

        assert!(!merger1.is_merged());
        assert!(!merger2.is_merged());
    }

    #[test]
    fn test_last_caller_unmerges() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger1 = QueueMerger::new(Arc::clone(&registry), owner, subsumed);
        let merger2 = QueueMerger::new(Arc::clone(&registry), owner, subsumed);

        // Recording alone never merges.
        merger1.record_merge_caller();
        merger2.record_merge_caller();
        assert!(!merger1.is_merged());
        assert!(!merger2.is_merged());

        merger1.merge_with_lease(5);
        merger2.merge_with_lease(5);
        assert!(merger1.is_merged());
        assert!(merger2.is_merged());

        // Two callers, so the first withdrawal keeps the merge.
        merger1.unmerge_now_if_last();
        assert!(merger1.is_merged());
        assert!(merger2.is_merged());

        merger2.unmerge_now_if_last();
        assert!(!merger1.is_merged());
        assert!(!merger2.is_merged());
    }

    #[test]
    fn test_mergers_on_disjoint_pairs_are_independent() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner1, subsumed1) = pair(&registry);
        let (owner2, subsumed2) = pair(&registry);
        let merger1 = QueueMerger::new(Arc::clone(&registry), owner1, subsumed1);
        let merger2 = QueueMerger::new(Arc::clone(&registry), owner2, subsumed2);

        merger1.merge_with_lease(2);
        assert!(merger1.is_merged());
        assert!(!merger2.is_merged());

        merger2.merge_with_lease(1);
        assert!(merger1.is_merged());
        assert!(merger2.is_merged());

        assert_eq!(merger2.decrement_lease(), MergerStatus::UnmergedNow);
        assert!(merger1.is_merged());
        assert!(!merger2.is_merged());
    }

    #[test]
    #[should_panic(expected = "cannot merge")]
    fn test_conflicting_merge_panics() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let other = registry.create_task_queue();
        let merger1 = QueueMerger::new(Arc::clone(&registry), owner, subsumed);
        let merger2 = QueueMerger::new(Arc::clone(&registry), owner, other);

        merger1.merge_with_lease(1);
        merger2.merge_with_lease(1);
    }

    #[test]
    fn test_wait_until_merged_blocks_until_merge() {
        let registry = Arc::new(TaskQueueRegistry::new());
        let (owner, subsumed) = pair(&registry);
        let merger = Arc::new(QueueMerger::new(registry, owner, subsumed));

        let waiter = {
            let merger = Arc::clone(&merger);
            thread::spawn(move || {
                merger.wait_until_merged();
                assert!(merger.is_merged());
            })
        };

        thread::sleep(Duration::from_millis(50));
        merger.merge_with_lease(1);
        waiter.join().unwrap();
        assert!(merger.is_merged());
    }
}
