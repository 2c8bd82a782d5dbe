//! Background compaction thread.

use crate::durable::DurableDatabaseFileSystem;
use log::{debug, error};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strata_common::{Result, StrataError};

/// Granularity at which the thread notices shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Handle to a running compactor. Stops and joins the thread on drop.
pub struct CompactorHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Stops the compactor and waits for the current pass to finish.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            if let Err(panic) = handle.join() {
                error!("{} panicked: {}", self.name, panic_message(panic.as_ref()));
            }
        }
    }

    /// Returns true while the thread is running.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodically compacts page logs into ranges and collects old range
/// versions.
pub struct Compactor;

impl Compactor {
    /// Starts a thread running one compaction and one garbage collection
    /// pass every `tick`.
    pub fn spawn(fs: Arc<DurableDatabaseFileSystem>, tick: Duration) -> Result<CompactorHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let name = format!("strata-compactor-{}-{}", fs.database_id(), fs.branch_id());

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut next_tick = Instant::now() + tick;
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                let now = Instant::now();
                if now < next_tick {
                    thread::sleep(POLL_INTERVAL.min(next_tick - now));
                    continue;
                }
                next_tick = now + tick;
                run_pass(&fs);
            }
        })?;

        Ok(CompactorHandle {
            name,
            shutdown,
            join: Some(handle),
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn run_pass(fs: &DurableDatabaseFileSystem) {
    match fs.compact() {
        Ok(stats) if !stats.is_noop() => debug!(
            "background compaction of {}/{}: {:?}",
            fs.database_id(),
            fs.branch_id(),
            stats
        ),
        Ok(_) | Err(StrataError::CompactionInProgress) => {}
        Err(e) => error!(
            "background compaction of {}/{} failed: {}",
            fs.database_id(),
            fs.branch_id(),
            e
        ),
    }

    if let Err(e) = fs.run_garbage_collection() {
        error!(
            "range garbage collection of {}/{} failed: {}",
            fs.database_id(),
            fs.branch_id(),
            e
        );
    }
}
