//! Wake-up capability consumed by run-loop drivers

use std::time::Instant;

/// Receiver for "the next eligible time changed" notifications
///
/// Implemented by whatever drives a task queue, typically the native run
/// loop that drains it. The registry calls `wake_up` every time a queue's
/// earliest pending target time changes: on registration, after every
/// poll, and when a merge or unmerge moves work between queues.
///
/// `deadline` is the earliest target time currently pending, or `None`
/// when the queue has nothing scheduled and the driver may park
/// indefinitely.
///
/// `wake_up` is invoked with registry locks held so deadlines arrive in
/// queue-state order. Implementations must not block and must not call
/// back into the registry or a merger; signal the driver and return.
pub trait Wakeable: Send + Sync {
    /// Called whenever the queue's next eligible execution time changes
    fn wake_up(&self, deadline: Option<Instant>);
}

/// Plain functions and closures work as wakeables directly.
impl<F> Wakeable for F
where
    F: Fn(Option<Instant>) + Send + Sync,
{
    fn wake_up(&self, deadline: Option<Instant>) {
        self(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_as_wakeable() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let wakeable: Arc<dyn Wakeable> = Arc::new(move |deadline: Option<Instant>| {
            sink.lock().unwrap().push(deadline);
        });

        let at = Instant::now();
        wakeable.wake_up(Some(at));
        wakeable.wake_up(None);

        assert_eq!(*seen.lock().unwrap(), vec![Some(at), None]);
    }
}
