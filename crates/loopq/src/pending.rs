//! Min-ordered pending task storage
//!
//! One `DelayedTaskQueue` backs each task queue in the registry. It is a
//! plain collection with no locking of its own; the registry keeps it
//! behind a per-queue mutex.
//!
//! # Complexity
//!
//! - Push: O(log n)
//! - Pop earliest: O(log n)
//! - Peek earliest: O(1)

use std::collections::BinaryHeap;
use std::time::Instant;

use loopq_core::DelayedTask;

/// Wrapper for heap ordering (earliest task first)
struct HeapEntry(DelayedTask);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest target time first,
        // ties broken by insertion sequence)
        other.0.cmp(&self.0)
    }
}

/// Pending tasks for one queue, earliest first
///
/// Draining pops tasks in `(target_time, sequence)` order regardless of
/// insertion order.
pub struct DelayedTaskQueue {
    heap: BinaryHeap<HeapEntry>,
}

impl DelayedTaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Create with room for `capacity` tasks before reallocating
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    /// Insert a task
    #[inline]
    pub fn push(&mut self, task: DelayedTask) {
        self.heap.push(HeapEntry(task));
    }

    /// Remove and return the earliest task
    #[inline]
    pub fn pop(&mut self) -> Option<DelayedTask> {
        self.heap.pop().map(|entry| entry.0)
    }

    /// The earliest task, without removing it
    #[inline]
    pub fn peek(&self) -> Option<&DelayedTask> {
        self.heap.peek().map(|entry| &entry.0)
    }

    /// Target time of the earliest task
    #[inline]
    pub fn next_target_time(&self) -> Option<Instant> {
        self.peek().map(DelayedTask::target_time)
    }

    /// Number of pending tasks
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is pending
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for DelayedTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
