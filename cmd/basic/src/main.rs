//! Basic task queue example
//!
//! Demonstrates a single task queue drained by a dedicated driver thread
//! that parks on a condition variable between deadlines. The registry
//! posts each new deadline through the queue's wakeable; the driver
//! sleeps until it is due, polls, runs the batch, and notifies the
//! queue's observers.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=loopq=debug` - Show queue lifecycle events
//! - `RUST_LOG=loopq=trace` - Also show per-task registration and polls

use loopq::{FlushType, TaskQueueRegistry, Wakeable};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

// RUST_LOG=loopq=trace cargo run -p loopq-basic
#[derive(Default)]
struct SignalState {
    deadline: Option<Instant>,
    kicked: bool,
}

/// Parks the driver thread until the registry's posted deadline is due.
struct DriverSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl DriverSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            condvar: Condvar::new(),
        }
    }

    /// Block until the current deadline is due or `kick` is called.
    fn wait(&self) {
        let mut state = self.state.lock();
        loop {
            if state.kicked {
                state.kicked = false;
                return;
            }
            match state.deadline {
                Some(deadline) => {
                    if deadline <= Instant::now() {
                        return;
                    }
                    self.condvar.wait_until(&mut state, deadline);
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }

    /// Make the next `wait` return immediately.
    fn kick(&self) {
        let mut state = self.state.lock();
        state.kicked = true;
        self.condvar.notify_one();
    }
}

impl Wakeable for DriverSignal {
    fn wake_up(&self, deadline: Option<Instant>) {
        let mut state = self.state.lock();
        state.deadline = deadline;
        self.condvar.notify_one();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== loopq Basic Example ===\n");

    let registry = TaskQueueRegistry::global();
    let queue = registry.create_task_queue();

    let signal = Arc::new(DriverSignal::new());
    registry.set_wakeable(queue, signal.clone());

    // Observer counting how many batches the driver ran.
    let batches = Arc::new(AtomicUsize::new(0));
    {
        let batches = batches.clone();
        registry.add_task_observer(
            queue,
            0,
            Arc::new(move || {
                batches.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let completed = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(AtomicBool::new(false));

    let driver = {
        let registry = registry.clone();
        let signal = signal.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("queue-driver".into())
            .spawn(move || {
                info!("driver started");
                let mut ready = Vec::new();
                loop {
                    signal.wait();
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    registry.poll_expired_tasks(queue, FlushType::All, &mut ready);
                    if ready.is_empty() {
                        continue;
                    }
                    let count = ready.len();
                    for task in ready.drain(..) {
                        task();
                    }
                    registry.notify_observers(queue);
                    info!(count, "ran a batch");
                }
                info!("driver stopped");
            })
            .expect("spawn driver thread")
    };

    // Three immediate tasks and two delayed ones.
    let now = Instant::now();
    for i in 1..=3 {
        let completed = completed.clone();
        registry.register_task(
            queue,
            Box::new(move || {
                println!("  task {i} ran immediately");
                completed.fetch_add(1, Ordering::SeqCst);
            }),
            now,
        );
    }
    for delay_ms in [100u64, 250] {
        let completed = completed.clone();
        registry.register_task(
            queue,
            Box::new(move || {
                println!("  task ran after {delay_ms}ms");
                completed.fetch_add(1, Ordering::SeqCst);
            }),
            now + Duration::from_millis(delay_ms),
        );
    }
    println!("Registered 5 tasks\n");

    // Wait for all of them to run.
    let start = Instant::now();
    let timeout = Duration::from_secs(5);
    while completed.load(Ordering::SeqCst) < 5 {
        if start.elapsed() > timeout {
            println!("WARNING: Timeout!");
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    println!(
        "\n{} task(s) completed in {} batch(es)",
        completed.load(Ordering::SeqCst),
        batches.load(Ordering::SeqCst)
    );

    let stats = registry.stats();
    println!(
        "Registry stats: {} registered, {} drained, {} wakeups",
        stats.tasks_registered, stats.tasks_drained, stats.wakeups
    );

    shutdown.store(true, Ordering::SeqCst);
    signal.kick();
    driver.join().expect("join driver thread");
    registry.dispose(queue);

    println!("\n=== Example Complete ===");
}
