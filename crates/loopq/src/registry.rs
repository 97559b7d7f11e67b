//! TaskQueueRegistry - process-wide table of task queues
//!
//! The registry maps queue identifiers to their pending work, observers,
//! and wake sink, and tracks which queues are merged into which. It owns
//! no threads: producers call in from anywhere, and one external driver
//! per (merged) queue is expected to drain it.
//!
//! # Lock order
//!
//! 1. The structural lock over the id-to-entry map: shared for the data
//!    plane, exclusive for create/dispose/merge/unmerge.
//! 2. Per-queue `tasks` mutexes: both halves of a merged pair are always
//!    taken in ascending queue id order.
//! 3. The wake target's `wakeable` mutex, taken while the task locks are
//!    held so deadlines reach the driver in heap-state order.
//!
//! `observers` mutexes nest directly inside the structural lock and
//! nothing is acquired under them. Observer callbacks and task closures
//! run with no registry lock held; wakeables fire with locks held and
//! must not call back in.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use loopq_core::{
    DelayedTask, FlushType, ObserverKey, TaskClosure, TaskObserver, TaskQueueId, Wakeable,
};

use crate::entry::TaskQueueEntry;
use crate::merger::MergerState;
use crate::pending::DelayedTaskQueue;

type EntryMap = HashMap<TaskQueueId, TaskQueueEntry>;

/// Process-wide registry shared by all run loops
static GLOBAL_REGISTRY: Lazy<Arc<TaskQueueRegistry>> =
    Lazy::new(|| Arc::new(TaskQueueRegistry::new()));

/// Which half of a merged pair holds the next eligible task
#[derive(Clone, Copy, PartialEq, Eq)]
enum PairSide {
    Owner,
    Subsumed,
}

/// Lifetime counters, updated with relaxed atomics
#[derive(Default)]
struct RegistryCounters {
    queues_created: AtomicU64,
    queues_disposed: AtomicU64,
    tasks_registered: AtomicU64,
    tasks_drained: AtomicU64,
    merges: AtomicU64,
    unmerges: AtomicU64,
    wakeups: AtomicU64,
}

/// Point-in-time scheduling counters
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Queues currently alive
    pub queues: usize,
    /// Queues created (lifetime)
    pub queues_created: u64,
    /// Queues disposed (lifetime)
    pub queues_disposed: u64,
    /// Tasks registered (lifetime)
    pub tasks_registered: u64,
    /// Tasks handed to drivers by polls (lifetime)
    pub tasks_drained: u64,
    /// Successful merges (lifetime)
    pub merges: u64,
    /// Successful unmerges (lifetime)
    pub unmerges: u64,
    /// Wakeable invocations (lifetime)
    pub wakeups: u64,
}

/// Table of task queues with time-ordered pending work
///
/// Each queue holds delayed tasks, observers, and an optional wake sink.
/// Two queues can be merged so one driver temporarily drains both, and
/// unmerged later without losing tasks or breaking their order.
///
/// Queue identifiers are never reused. Task order within a (possibly
/// merged) queue is total: earlier target time first, registration order
/// among equal times.
///
/// # Example
///
/// ```
/// use loopq::{FlushType, TaskQueueRegistry};
/// use std::time::{Duration, Instant};
///
/// let registry = TaskQueueRegistry::new();
/// let queue = registry.create_task_queue();
///
/// registry.register_task(queue, Box::new(|| println!("now")), Instant::now());
/// registry.register_task(
///     queue,
///     Box::new(|| println!("later")),
///     Instant::now() + Duration::from_secs(60),
/// );
///
/// let mut ready = Vec::new();
/// registry.poll_expired_tasks(queue, FlushType::All, &mut ready);
/// assert_eq!(ready.len(), 1);
/// for task in ready {
///     task();
/// }
/// assert!(registry.has_pending_tasks(queue));
/// ```
pub struct TaskQueueRegistry {
    /// Structural lock: which queues exist and how they are merged
    entries: RwLock<EntryMap>,

    /// Next queue identifier, never recycled
    next_queue_id: AtomicU32,

    /// Global insertion sequence shared by every queue
    sequence: AtomicU64,

    /// Lifetime counters
    counters: RegistryCounters,

    /// Shared lease state for QueueMergers, keyed by (owner, subsumed)
    merger_states: Mutex<HashMap<(TaskQueueId, TaskQueueId), Arc<MergerState>>>,
}

impl TaskQueueRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    /// Create with room for `queues` live queues before rehashing
    pub fn with_capacity(queues: usize) -> Self {
        Self {
            entries: RwLock::new(EntryMap::with_capacity(queues)),
            next_queue_id: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
            counters: RegistryCounters::default(),
            merger_states: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry
    ///
    /// One registry normally serves the whole process, so queue ids stay
    /// unique across subsystems. Separate instances are for tests and
    /// embedders that contain their own run loops.
    pub fn global() -> Arc<TaskQueueRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a new, empty task queue
    ///
    /// Never fails; the returned identifier is unique for the process
    /// lifetime.
    pub fn create_task_queue(&self) -> TaskQueueId {
        let id = TaskQueueId::new(self.next_queue_id.fetch_add(1, Ordering::Relaxed));
        assert!(id.is_some(), "task queue id space exhausted");

        let mut entries = self.entries.write();
        entries.insert(id, TaskQueueEntry::new());
        drop(entries);

        self.counters.queues_created.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %id, "created task queue");
        id
    }

    /// Remove a queue, discarding its pending tasks and observers
    ///
    /// If the queue currently owns another, the owned queue is removed as
    /// well.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist, or if it is subsumed by
    /// another queue (unmerge first).
    pub fn dispose(&self, queue_id: TaskQueueId) {
        let mut entries = self.entries.write();
        let (owner_of, subsumed_by) = {
            let entry = Self::expect_entry(&entries, queue_id);
            (entry.owner_of, entry.subsumed_by)
        };
        assert!(
            subsumed_by.is_none(),
            "task queue {queue_id} is subsumed by {subsumed_by} and cannot be disposed; unmerge it first"
        );

        let removed = entries.remove(&queue_id);
        let removed_subsumed = if owner_of.is_some() {
            entries.remove(&owner_of)
        } else {
            None
        };
        self.counters
            .queues_disposed
            .fetch_add(1 + removed_subsumed.is_some() as u64, Ordering::Relaxed);
        debug!(queue = %queue_id, cascaded = removed_subsumed.is_some(), "disposed task queue");
        drop(entries);

        // Undrained closures are dropped here, outside the lock; their
        // destructors are arbitrary user code.
        drop(removed);
        drop(removed_subsumed);
    }

    /// Number of queues currently alive
    pub fn queue_count(&self) -> usize {
        self.entries.read().len()
    }

    // ========================================================================
    // Task registration and draining
    // ========================================================================

    /// Register a task to run at or after `target_time`
    ///
    /// The task is stamped with the next global sequence number, and the
    /// wakeable of whichever queue is logically awake for `queue_id` (the
    /// queue itself, or its owner while merged) is fired with the new
    /// earliest eligible time across the merged pair.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn register_task(&self, queue_id: TaskQueueId, task: TaskClosure, target_time: Instant) {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        // A subsumed queue cannot wake itself; its owner is woken instead.
        let wake_target = if entry.is_subsumed() {
            entry.subsumed_by
        } else {
            queue_id
        };
        let target_entry = if wake_target == queue_id {
            entry
        } else {
            Self::expect_entry(&entries, wake_target)
        };
        let paired_id = target_entry.owner_of;
        let paired = if paired_id.is_some() {
            Some(Self::expect_entry(&entries, paired_id))
        } else {
            None
        };

        let (mut owner_tasks, mut subsumed_tasks) =
            Self::lock_pair_tasks(wake_target, target_entry, paired_id, paired);

        let task = DelayedTask::new(sequence, task, target_time);
        if queue_id == wake_target {
            owner_tasks.push(task);
        } else {
            subsumed_tasks
                .as_deref_mut()
                .expect("subsumed queue is paired with its owner")
                .push(task);
        }

        let next = Self::next_wake_time(&owner_tasks, subsumed_tasks.as_deref());
        self.fire_wakeable(target_entry, next);

        self.counters.tasks_registered.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %queue_id, sequence, "registered task");
    }

    /// True when the queue, plus the queue it owns if any, has pending
    /// tasks
    ///
    /// Always false for a queue that is currently subsumed: its backlog
    /// is reachable only through its owner.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn has_pending_tasks(&self, queue_id: TaskQueueId) -> bool {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        if entry.is_subsumed() {
            return false;
        }
        let own_pending = !entry.tasks.lock().is_empty();
        if own_pending {
            return true;
        }
        if !entry.is_owner() {
            return false;
        }
        let subsumed = Self::expect_entry(&entries, entry.owner_of);
        let subsumed_pending = !subsumed.tasks.lock().is_empty();
        subsumed_pending
    }

    /// Count of pending tasks visible through this queue
    ///
    /// An owner counts its own and its subsumed queue's tasks, each once.
    /// A subsumed queue reports 0.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn num_pending_tasks(&self, queue_id: TaskQueueId) -> usize {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        if entry.is_subsumed() {
            return 0;
        }
        let mut count = entry.tasks.lock().len();
        if entry.is_owner() {
            count += Self::expect_entry(&entries, entry.owner_of).tasks.lock().len();
        }
        count
    }

    /// Move every task eligible at the time of the call into `out`
    ///
    /// "Now" is computed once at entry. While the merged pair has a task
    /// with target time at or before now, the earliest is removed from
    /// whichever half holds it and appended to `out` (which is not
    /// cleared). `FlushType::Single` stops after the first.
    ///
    /// Exactly one wake refresh happens per call, whether or not anything
    /// was drained: the queue's wakeable receives the next eligible time,
    /// or `None` when nothing is left. Polling a subsumed queue drains
    /// nothing and parks its driver.
    ///
    /// Tasks are delivered at most once across all polls. Concurrent
    /// polls of the same queue do not break that, but how tasks split
    /// between their `out` vectors is unspecified; a queue is meant to be
    /// drained by one driver at a time.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn poll_expired_tasks(
        &self,
        queue_id: TaskQueueId,
        flush: FlushType,
        out: &mut Vec<TaskClosure>,
    ) {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);

        if entry.is_subsumed() {
            // The owner runs this queue's work while merged.
            let _tasks = entry.tasks.lock();
            self.fire_wakeable(entry, None);
            return;
        }

        let paired_id = entry.owner_of;
        let paired = if paired_id.is_some() {
            Some(Self::expect_entry(&entries, paired_id))
        } else {
            None
        };

        let now = Instant::now();
        let mut drained = 0u64;

        let (mut owner_tasks, mut subsumed_tasks) =
            Self::lock_pair_tasks(queue_id, entry, paired_id, paired);

        loop {
            let side = match Self::peek_next_task(&owner_tasks, subsumed_tasks.as_deref()) {
                Some((side, task)) if task.target_time() <= now => side,
                _ => break,
            };
            let task = match side {
                PairSide::Owner => owner_tasks.pop(),
                PairSide::Subsumed => subsumed_tasks.as_deref_mut().and_then(DelayedTaskQueue::pop),
            };
            match task {
                Some(task) => out.push(task.into_task()),
                None => break,
            }
            drained += 1;
            if flush == FlushType::Single {
                break;
            }
        }

        // One wake refresh per poll, drained or not; None parks the driver.
        let next = Self::next_wake_time(&owner_tasks, subsumed_tasks.as_deref());
        self.fire_wakeable(entry, next);

        self.counters.tasks_drained.fetch_add(drained, Ordering::Relaxed);
        trace!(queue = %queue_id, drained, "polled expired tasks");
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Add an observer under a caller-chosen key
    ///
    /// Observers fire in insertion order. Adding with an existing key
    /// replaces that observer in place.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn add_task_observer(
        &self,
        queue_id: TaskQueueId,
        key: ObserverKey,
        observer: TaskObserver,
    ) {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        entry.observers.lock().insert(key, observer);
    }

    /// Remove the observer registered under `key`, if any
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn remove_task_observer(&self, queue_id: TaskQueueId, key: ObserverKey) {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        entry.observers.lock().shift_remove(&key);
    }

    /// Run the queue's observers, then those of the queue it owns
    ///
    /// Insertion order within each queue, owner side first. A no-op on a
    /// subsumed queue: while merged, its observers run through the owner.
    ///
    /// Callbacks are invoked after every registry lock is released, so an
    /// observer may re-enter the registry. An observer removed while a
    /// notification is in flight can still run that one time.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn notify_observers(&self, queue_id: TaskQueueId) {
        let snapshot: Vec<TaskObserver> = {
            let entries = self.entries.read();
            let entry = Self::expect_entry(&entries, queue_id);
            if entry.is_subsumed() {
                return;
            }
            let mut observers: Vec<TaskObserver> =
                entry.observers.lock().values().cloned().collect();
            if entry.is_owner() {
                let subsumed = Self::expect_entry(&entries, entry.owner_of);
                observers.extend(subsumed.observers.lock().values().cloned());
            }
            observers
        };

        for observer in snapshot {
            observer();
        }
    }

    // ========================================================================
    // Wakeable plumbing
    // ========================================================================

    /// Attach the wake sink for the driver that drains this queue
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist or already has a wakeable; a
    /// queue's wakeable is set at most once in its lifetime.
    pub fn set_wakeable(&self, queue_id: TaskQueueId, wakeable: Arc<dyn Wakeable>) {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, queue_id);
        let mut slot = entry.wakeable.lock();
        assert!(
            slot.is_none(),
            "task queue {queue_id} already has a wakeable; it can be set only once"
        );
        *slot = Some(wakeable);
    }

    // ========================================================================
    // Merge / unmerge
    // ========================================================================

    /// Let `owner` absorb `subsumed` until unmerged
    ///
    /// While merged, draining `owner` delivers both queues' tasks in
    /// global order, and `subsumed` neither reports pending work nor
    /// wakes its own driver. Returns true if the queues are merged this
    /// way when the call returns: merging a queue with itself and
    /// re-merging an existing pair are no-ops that succeed. Returns false
    /// without side effects when either queue is already in any other
    /// merge relationship.
    ///
    /// # Panics
    ///
    /// Panics if either queue does not exist.
    pub fn merge(&self, owner: TaskQueueId, subsumed: TaskQueueId) -> bool {
        if owner == subsumed {
            return true;
        }
        let mut entries = self.entries.write();
        let (owner_owns, owner_subsumed_by) = {
            let entry = Self::expect_entry(&entries, owner);
            (entry.owner_of, entry.subsumed_by)
        };
        let (subsumed_owns, subsumed_subsumed_by) = {
            let entry = Self::expect_entry(&entries, subsumed);
            (entry.owner_of, entry.subsumed_by)
        };

        if owner_owns == subsumed {
            return true;
        }
        if owner_owns.is_some()
            || owner_subsumed_by.is_some()
            || subsumed_owns.is_some()
            || subsumed_subsumed_by.is_some()
        {
            return false;
        }

        Self::expect_entry_mut(&mut entries, owner).owner_of = subsumed;
        Self::expect_entry_mut(&mut entries, subsumed).subsumed_by = owner;
        self.counters.merges.fetch_add(1, Ordering::Relaxed);
        debug!(owner = %owner, subsumed = %subsumed, "merged task queues");

        // Re-arm the owner if the combined pair already has work.
        let owner_entry = Self::expect_entry(&entries, owner);
        let subsumed_entry = Self::expect_entry(&entries, subsumed);
        let (owner_tasks, subsumed_tasks) =
            Self::lock_pair_tasks(owner, owner_entry, subsumed, Some(subsumed_entry));
        if let Some(next) = Self::next_wake_time(&owner_tasks, subsumed_tasks.as_deref()) {
            self.fire_wakeable(owner_entry, Some(next));
        }
        true
    }

    /// Undo `merge`, restoring both queues to independence
    ///
    /// Returns false if `owner` does not currently own another queue.
    /// After a successful unmerge each side's wakeable is re-armed with
    /// its own next eligible time, if it has one.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist.
    pub fn unmerge(&self, owner: TaskQueueId) -> bool {
        let mut entries = self.entries.write();
        let subsumed = Self::expect_entry(&entries, owner).owner_of;
        if subsumed.is_none() {
            return false;
        }

        Self::expect_entry_mut(&mut entries, owner).owner_of = TaskQueueId::NONE;
        Self::expect_entry_mut(&mut entries, subsumed).subsumed_by = TaskQueueId::NONE;
        self.counters.unmerges.fetch_add(1, Ordering::Relaxed);
        debug!(owner = %owner, subsumed = %subsumed, "unmerged task queues");

        // Each side re-arms independently with its own backlog.
        for id in [owner, subsumed] {
            let entry = Self::expect_entry(&entries, id);
            let tasks = entry.tasks.lock();
            if let Some(next) = Self::next_wake_time(&tasks, None) {
                self.fire_wakeable(entry, Some(next));
            }
        }
        true
    }

    /// True when `candidate` is `owner` itself or the queue it absorbed
    ///
    /// # Panics
    ///
    /// Panics if `owner` does not exist, even when the two ids are equal.
    pub fn owns(&self, owner: TaskQueueId, candidate: TaskQueueId) -> bool {
        let entries = self.entries.read();
        let entry = Self::expect_entry(&entries, owner);
        owner == candidate || entry.owner_of == candidate
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Snapshot of the scheduling counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            queues: self.entries.read().len(),
            queues_created: self.counters.queues_created.load(Ordering::Relaxed),
            queues_disposed: self.counters.queues_disposed.load(Ordering::Relaxed),
            tasks_registered: self.counters.tasks_registered.load(Ordering::Relaxed),
            tasks_drained: self.counters.tasks_drained.load(Ordering::Relaxed),
            merges: self.counters.merges.load(Ordering::Relaxed),
            unmerges: self.counters.unmerges.load(Ordering::Relaxed),
            wakeups: self.counters.wakeups.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Shared lease state for mergers of this ordered pair
    pub(crate) fn merger_state(
        &self,
        owner: TaskQueueId,
        subsumed: TaskQueueId,
    ) -> Arc<MergerState> {
        let mut states = self.merger_states.lock();
        states
            .entry((owner, subsumed))
            .or_insert_with(|| Arc::new(MergerState::new()))
            .clone()
    }

    fn expect_entry<'a>(entries: &'a EntryMap, queue_id: TaskQueueId) -> &'a TaskQueueEntry {
        match entries.get(&queue_id) {
            Some(entry) => entry,
            None => panic!("task queue {queue_id} is not registered"),
        }
    }

    fn expect_entry_mut<'a>(
        entries: &'a mut EntryMap,
        queue_id: TaskQueueId,
    ) -> &'a mut TaskQueueEntry {
        match entries.get_mut(&queue_id) {
            Some(entry) => entry,
            None => panic!("task queue {queue_id} is not registered"),
        }
    }

    /// Lock the task heaps of a (possibly merged) pair
    ///
    /// Both heaps are locked in ascending queue id order regardless of
    /// their (owner, subsumed) roles; the guards come back in role order.
    fn lock_pair_tasks<'a>(
        owner_id: TaskQueueId,
        owner: &'a TaskQueueEntry,
        subsumed_id: TaskQueueId,
        subsumed: Option<&'a TaskQueueEntry>,
    ) -> (
        MutexGuard<'a, DelayedTaskQueue>,
        Option<MutexGuard<'a, DelayedTaskQueue>>,
    ) {
        match subsumed {
            None => (owner.tasks.lock(), None),
            Some(entry) if owner_id < subsumed_id => {
                let first = owner.tasks.lock();
                let second = entry.tasks.lock();
                (first, Some(second))
            }
            Some(entry) => {
                let second = entry.tasks.lock();
                let first = owner.tasks.lock();
                (first, Some(second))
            }
        }
    }

    /// Pick the earlier of the two heads of a merged pair
    fn peek_next_task<'a>(
        owner: &'a DelayedTaskQueue,
        subsumed: Option<&'a DelayedTaskQueue>,
    ) -> Option<(PairSide, &'a DelayedTask)> {
        match (owner.peek(), subsumed.and_then(DelayedTaskQueue::peek)) {
            (Some(own), Some(sub)) => {
                if sub < own {
                    Some((PairSide::Subsumed, sub))
                } else {
                    Some((PairSide::Owner, own))
                }
            }
            (Some(own), None) => Some((PairSide::Owner, own)),
            (None, Some(sub)) => Some((PairSide::Subsumed, sub)),
            (None, None) => None,
        }
    }

    /// The next eligible time across a (possibly merged) pair of heaps
    fn next_wake_time(
        owner: &DelayedTaskQueue,
        subsumed: Option<&DelayedTaskQueue>,
    ) -> Option<Instant> {
        Self::peek_next_task(owner, subsumed).map(|(_, task)| task.target_time())
    }

    /// Deliver a new deadline to the queue's driver, if one is attached
    ///
    /// Callers hold the relevant task locks, so deadlines cannot arrive
    /// out of heap-state order.
    fn fire_wakeable(&self, entry: &TaskQueueEntry, deadline: Option<Instant>) {
        let wakeable = entry.wakeable.lock();
        if let Some(wakeable) = wakeable.as_ref() {
            wakeable.wake_up(deadline);
            self.counters.wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for TaskQueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueueRegistry")
            .field("queues", &self.entries.read().len())
            .field("tasks_registered", &self.counters.tasks_registered.load(Ordering::Relaxed))
            .finish()
    }
}
