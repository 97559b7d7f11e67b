//! Task queue identifier type

use core::fmt;

/// Unique identifier for a task queue
///
/// This is a 32-bit value handed out by the registry. Identifiers are
/// never reused within a process, and the maximum value (u32::MAX) is
/// reserved as a sentinel meaning "no queue" in merge relationships.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskQueueId(u32);

impl TaskQueueId {
    /// Sentinel value indicating no queue
    pub const NONE: TaskQueueId = TaskQueueId(u32::MAX);

    /// Create a new TaskQueueId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        TaskQueueId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this refers to an actual queue
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<TaskQueueId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for TaskQueueId {
    #[inline]
    fn from(id: u32) -> Self {
        TaskQueueId(id)
    }
}

impl From<TaskQueueId> for u32 {
    #[inline]
    fn from(id: TaskQueueId) -> Self {
        id.0
    }
}

impl fmt::Debug for TaskQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskQueueId(NONE)")
        } else {
            write!(f, "TaskQueueId({})", self.0)
        }
    }
}

impl fmt::Display for TaskQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for TaskQueueId {
    fn default() -> Self {
        TaskQueueId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_queue_id_basics() {
        let id = TaskQueueId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(!id.is_none());
        assert!(id.is_some());
    }

    #[test]
    fn test_task_queue_id_none() {
        let none = TaskQueueId::NONE;
        assert!(none.is_none());
        assert!(!none.is_some());
        assert_eq!(none.to_option(), None);
        assert_eq!(format!("{}", none), "none");
        assert_eq!(format!("{:?}", none), "TaskQueueId(NONE)");
    }

    #[test]
    fn test_task_queue_id_conversions() {
        let id: TaskQueueId = 100u32.into();
        let raw: u32 = id.into();
        assert_eq!(raw, 100);
    }
}
