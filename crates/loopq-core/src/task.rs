//! Delayed task value types

use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

/// Opaque unit of work, executed at most once
pub type TaskClosure = Box<dyn FnOnce() + Send>;

/// How much eligible work a single poll may drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Drain at most one eligible task
    Single,

    /// Drain every eligible task
    All,
}

/// A unit of work scheduled for a target execution time
///
/// Tasks are totally ordered: earlier target time first, with the
/// registry-global insertion sequence breaking ties so equal-time tasks
/// drain in FIFO order. The sequence is global rather than per-queue so
/// the order survives queue merges and unmerges.
pub struct DelayedTask {
    /// Registry-global insertion sequence
    sequence: u64,

    /// The work itself
    task: TaskClosure,

    /// When the task becomes eligible to run
    target_time: Instant,
}

impl DelayedTask {
    /// Create a new delayed task
    pub fn new(sequence: u64, task: TaskClosure, target_time: Instant) -> Self {
        Self {
            sequence,
            task,
            target_time,
        }
    }

    /// The insertion sequence assigned by the registry
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the task becomes eligible to run
    #[inline]
    pub fn target_time(&self) -> Instant {
        self.target_time
    }

    /// Consume the task, yielding its closure for execution
    #[inline]
    pub fn into_task(self) -> TaskClosure {
        self.task
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.target_time == other.target_time && self.sequence == other.sequence
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest target time first; sequence breaks ties (FIFO)
        self.target_time
            .cmp(&other.target_time)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl fmt::Debug for DelayedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTask")
            .field("sequence", &self.sequence)
            .field("target_time", &self.target_time)
            .finish_non_exhaustive()
    }
}
