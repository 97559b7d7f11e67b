//! Queue merging example
//!
//! Demonstrates two task queues, each drained by its own driver thread,
//! merged under the first driver for a fixed number of turns and handed
//! back when the lease expires. Tasks print the thread that ran them, so
//! the hand-over is visible in the output.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=loopq=debug` - Show merge and unmerge events

use loopq::{FlushType, QueueMerger, TaskClosure, TaskQueueId, TaskQueueRegistry};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A driver that polls its queue every couple of milliseconds.
///
/// Simpler than parking on a wakeable; while its queue is subsumed every
/// poll comes back empty and the loop just spins quietly.
fn spawn_driver(
    name: &str,
    registry: Arc<TaskQueueRegistry>,
    queue: TaskQueueId,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut ready = Vec::new();
            while !shutdown.load(Ordering::SeqCst) {
                registry.poll_expired_tasks(queue, FlushType::All, &mut ready);
                for task in ready.drain(..) {
                    task();
                }
                thread::sleep(Duration::from_millis(2));
            }
        })
        .expect("spawn driver thread")
}

fn announce(tag: String, done: Arc<AtomicUsize>) -> TaskClosure {
    Box::new(move || {
        let thread = thread::current();
        println!("  [{tag}] ran on {}", thread.name().unwrap_or("unnamed"));
        done.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_for(done: &AtomicUsize, target: usize) {
    let start = Instant::now();
    while done.load(Ordering::SeqCst) < target {
        if start.elapsed() > Duration::from_secs(5) {
            println!("WARNING: Timeout!");
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== loopq Merge Example ===\n");

    let registry = TaskQueueRegistry::global();
    let ui = registry.create_task_queue();
    let render = registry.create_task_queue();
    let shutdown = Arc::new(AtomicBool::new(false));

    let ui_driver = spawn_driver("ui-driver", registry.clone(), ui, shutdown.clone());
    let render_driver = spawn_driver("render-driver", registry.clone(), render, shutdown.clone());

    let done = Arc::new(AtomicUsize::new(0));

    // Unmerged: each queue runs its tasks on its own driver.
    println!("Unmerged:");
    registry.register_task(ui, announce("ui task".into(), done.clone()), Instant::now());
    registry.register_task(render, announce("render task".into(), done.clone()), Instant::now());
    wait_for(&done, 2);

    // Merged: the ui driver runs both queues until the lease runs out.
    const LEASE_TURNS: usize = 3;
    let merger = QueueMerger::new(registry.clone(), ui, render);
    merger.set_merge_unmerge_callback(|| println!("  (merge state changed)"));

    println!("\nMerging render into ui for {LEASE_TURNS} turns:");
    merger.merge_with_lease(LEASE_TURNS);

    for turn in 1..=LEASE_TURNS {
        let before = done.load(Ordering::SeqCst);
        registry.register_task(
            render,
            announce(format!("render task, turn {turn}"), done.clone()),
            Instant::now(),
        );
        wait_for(&done, before + 1);
        let status = merger.decrement_lease();
        println!("  turn {turn} done, lease status: {status:?}");
    }

    // Unmerged again: render work goes back to its own driver.
    println!("\nLease expired (merged = {}):", merger.is_merged());
    let before = done.load(Ordering::SeqCst);
    registry.register_task(render, announce("render task".into(), done.clone()), Instant::now());
    wait_for(&done, before + 1);

    shutdown.store(true, Ordering::SeqCst);
    ui_driver.join().expect("join ui driver");
    render_driver.join().expect("join render driver");
    registry.dispose(ui);
    registry.dispose(render);

    println!("\n=== Example Complete ===");
}
