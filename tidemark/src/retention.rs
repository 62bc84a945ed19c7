//! Retention sweeping.
//!
//! A sweep pass computes `cutoff = now - retention` and removes every entry
//! with a timestamp below the cutoff from every source, then commits once.
//! Failures are isolated per source: a source that fails to sweep is reported
//! and skipped, and the remaining sources are still swept. Nothing is retried
//! within a pass; the next pass picks the source up again.
//!
//! The [`Sweeper`] runs passes on a background thread at a fixed rate. It is
//! owned by the database and stopped when the database closes.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::{Result, StorageError};
use crate::storage::{ErasedMap, Storage};

/// How long [`Sweeper::stop`] waits for a running pass before detaching it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A source that could not be swept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    /// The source id.
    pub source: String,
    /// What went wrong.
    pub reason: String,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries with a timestamp below this were removed.
    pub cutoff: i64,
    /// Number of entries removed, per source id.
    pub removed: BTreeMap<String, usize>,
    /// Sources whose sweep failed.
    pub failures: Vec<SweepFailure>,
    /// Whether the pass stopped early because the sweeper was cancelled.
    pub cancelled: bool,
}

impl SweepReport {
    /// Total number of entries removed across all sources.
    pub fn total_removed(&self) -> usize {
        self.removed.values().sum()
    }
}

/// Runs one sweep pass over `targets`.
///
/// `cancel` is checked before each source. A cancelled pass does not commit.
///
/// # Errors
///
/// Returns the error of the final commit. Per-source failures are recorded in
/// the report instead.
pub(crate) fn sweep(
    storage: &Storage,
    targets: Vec<(String, Arc<dyn ErasedMap>)>,
    cutoff: i64,
    cancel: &AtomicBool,
) -> Result<SweepReport> {
    let mut report = SweepReport {
        cutoff,
        ..SweepReport::default()
    };

    for (source, map) in targets {
        if cancel.load(Ordering::Acquire) {
            report.cancelled = true;
            warn!(cutoff, "sweep pass cancelled");
            return Ok(report);
        }

        match catch_unwind(AssertUnwindSafe(|| map.remove_before(cutoff))) {
            Ok(Ok(removed)) => {
                report.removed.insert(source, removed);
            }
            Ok(Err(e)) => {
                warn!(source = %source, error = %e, "failed to sweep source");
                report.failures.push(SweepFailure {
                    source,
                    reason: e.to_string(),
                });
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                warn!(source = %source, reason = %reason, "sweep of source panicked");
                report.failures.push(SweepFailure { source, reason });
            }
        }
    }

    storage.commit()?;
    debug!(
        cutoff,
        removed = report.total_removed(),
        failures = report.failures.len(),
        "sweep pass finished"
    );
    Ok(report)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "(non-string panic)".to_string())
}

#[derive(Debug, Default)]
struct State {
    stop: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct Control {
    state: Mutex<State>,
    wake: Condvar,
    done: Condvar,
    cancel: AtomicBool,
}

/// Background thread running sweep passes at a fixed rate.
#[derive(Debug)]
pub struct Sweeper {
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Starts the sweeper thread. The first pass runs one `interval` after start.
    ///
    /// `pass` receives the cancellation flag and should stop between sources
    /// once it is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the thread cannot be spawned.
    pub(crate) fn start<F>(interval: Duration, pass: F) -> Result<Self>
    where
        F: Fn(&AtomicBool) + Send + 'static,
    {
        let control = Arc::new(Control::default());
        let thread_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name("tidemark-sweeper".to_string())
            .spawn(move || run(&thread_control, interval, &pass))
            .map_err(|source| StorageError::Io {
                path: "tidemark-sweeper".to_string(),
                source,
            })?;

        debug!(interval = ?interval, "sweeper started");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Stops the sweeper.
    ///
    /// Waits up to `grace` for a running pass to finish. If it does not, the
    /// pass is told to cancel and the thread is detached. Returns `true` if the
    /// thread was joined.
    pub fn stop(mut self, grace: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + grace;
        let mut state = self.control.state.lock();
        state.stop = true;
        self.control.wake.notify_all();
        while !state.finished {
            if self.control.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let finished = state.finished;
        drop(state);

        if finished {
            if handle.join().is_err() {
                error!("sweeper thread panicked");
            }
            debug!("sweeper stopped");
            true
        } else {
            self.control.cancel.store(true, Ordering::Release);
            warn!(grace = ?grace, "sweeper did not stop in time, detaching");
            false
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let mut state = self.control.state.lock();
            state.stop = true;
            self.control.cancel.store(true, Ordering::Release);
            self.control.wake.notify_all();
        }
    }
}

fn run<F>(control: &Control, interval: Duration, pass: &F)
where
    F: Fn(&AtomicBool),
{
    let mut state = control.state.lock();
    // `None` means the next pass lies beyond what `Instant` can represent.
    let mut next = Instant::now().checked_add(interval);

    loop {
        while !state.stop {
            match next {
                Some(deadline) => {
                    if control.wake.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => control.wake.wait(&mut state),
            }
        }
        if state.stop {
            break;
        }

        MutexGuard::unlocked(&mut state, || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| pass(&control.cancel))) {
                error!(reason = %panic_message(&*panic), "sweep pass panicked");
            }
        });

        let now = Instant::now();
        next = next
            .and_then(|n| n.checked_add(interval))
            .filter(|n| *n > now)
            .or_else(|| now.checked_add(interval));
    }

    state.finished = true;
    control.done.notify_all();
}
