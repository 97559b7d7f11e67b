//! # loopq
//!
//! Multi-queue task scheduling for externally driven run loops.
//!
//! This crate provides:
//! - A process-wide registry of task queues with time-ordered tasks
//! - Wake-up plumbing that tells each queue's driver when to poll next
//! - Task observers that run after every drained task
//! - On-demand merging of two queues under one driver, with lease-based
//!   control via [`QueueMerger`]
//!
//! The registry owns no threads and performs no I/O. Embedders attach a
//! [`Wakeable`] per queue, park in their own loop, and call
//! [`TaskQueueRegistry::poll_expired_tasks`] whenever the deadline they
//! were last handed arrives.
//!
//! ```
//! use loopq::{FlushType, TaskQueueRegistry};
//! use std::time::Instant;
//!
//! let registry = TaskQueueRegistry::global();
//! let queue = registry.create_task_queue();
//!
//! registry.register_task(queue, Box::new(|| println!("hello")), Instant::now());
//!
//! let mut ready = Vec::new();
//! registry.poll_expired_tasks(queue, FlushType::All, &mut ready);
//! for task in ready {
//!     task();
//! }
//! registry.dispose(queue);
//! ```

mod entry;

pub mod merger;
pub mod pending;
pub mod registry;

// Re-exports
pub use loopq_core::{
    DelayedTask, FlushType, ObserverKey, TaskClosure, TaskObserver, TaskQueueId, Wakeable,
};
pub use merger::{MergerStatus, QueueMerger};
pub use pending::DelayedTaskQueue;
pub use registry::{RegistryStats, TaskQueueRegistry};
