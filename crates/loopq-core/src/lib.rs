//! # loopq-core
//!
//! Value types for the loopq task queue scheduler.
//!
//! This crate is platform-agnostic and dependency-light: identifiers,
//! delayed-task values, and the capability types through which the
//! registry talks to run-loop drivers. All scheduling mechanics live in
//! the `loopq` crate.
//!
//! ## Modules
//!
//! - `id` - Task queue identifier type
//! - `task` - Delayed task, closure, and flush-type values
//! - `wake` - Wakeable capability consumed by run-loop drivers
//! - `observer` - Per-iteration observer hooks

pub mod id;
pub mod observer;
pub mod task;
pub mod wake;

// Re-exports for convenience
pub use id::TaskQueueId;
pub use observer::{ObserverKey, TaskObserver};
pub use task::{DelayedTask, FlushType, TaskClosure};
pub use wake::Wakeable;
