//! Per-iteration observer hooks

use std::sync::Arc;

/// Opaque identity for a registered observer
///
/// Chosen by the caller and compared only for equality, never
/// dereferenced. Typically the address of the object that registered the
/// observer, so the same object can remove it later.
pub type ObserverKey = usize;

/// Callback invoked after each run-loop iteration that executed tasks
///
/// Observers fire in the order they were added. They run outside every
/// registry lock, so an observer may call back into the registry.
pub type TaskObserver = Arc<dyn Fn() + Send + Sync>;
