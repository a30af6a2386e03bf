//! Divergence monitor.
//!
//! A background thread that wakes once per period and checks that the
//! runner completed at least one step since the last wake-up. A period
//! without progress is a divergence.
//!
//! A monitor started with [`start`](DivergenceMonitor::start) only records
//! the divergence; the runner picks it up after the current step returns.
//! One started with [`start_fatal`](DivergenceMonitor::start_fatal) cannot
//! rely on the step ever returning: it writes the choices of the stuck path
//! to an error path file and aborts the process from the monitor thread.
//! The thread never touches simulation state: it shares atomics and the
//! choice snapshot the runner publishes before each step.

use crate::random::{write_choices, Choice};
use im::Vector;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

const POLL_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct Shared {
    progressed: AtomicBool,
    diverged: AtomicBool,
    paused: AtomicBool,
    stop: AtomicBool,
    /// Step the runner is executing.
    step: AtomicU64,
    /// Choices of the current path up to the step being executed.
    choices: Mutex<Vector<Choice>>,
}

/// Handle to the monitor thread; stops and joins it on drop.
#[derive(Debug)]
pub struct DivergenceMonitor {
    shared: Arc<Shared>,
    /// Error path file written before a fatal abort.
    fatal_path: Option<PathBuf>,
    handle: Option<JoinHandle<()>>,
}

impl DivergenceMonitor {
    /// Start a monitor that records a missing-progress period.
    pub fn start(period: Duration) -> Self {
        Self::spawn(period, None)
    }

    /// Start a monitor that writes the stuck path to `error_path` and
    /// aborts the process when a period passes without progress.
    pub fn start_fatal(period: Duration, error_path: PathBuf) -> Self {
        Self::spawn(period, Some(error_path))
    }

    fn spawn(period: Duration, fatal_path: Option<PathBuf>) -> Self {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let target = fatal_path.clone();
        let handle = thread::Builder::new()
            .name("divergence-monitor".into())
            .spawn(move || run(worker, period, target))
            .map_err(|e| error!(error = %e, "could not start divergence monitor"))
            .ok();
        Self {
            shared,
            fatal_path,
            handle,
        }
    }

    /// Whether a divergence aborts the process.
    pub fn is_fatal(&self) -> bool {
        self.fatal_path.is_some()
    }

    /// The runner is about to execute `step` after making `choices`.
    /// Only a fatal monitor keeps the snapshot.
    pub fn checkpoint(&self, step: u64, choices: impl FnOnce() -> Vector<Choice>) {
        self.shared.step.store(step, Ordering::Release);
        if self.is_fatal() {
            *self.shared.choices.lock() = choices();
        }
    }

    /// The runner finished a step.
    pub fn signal(&self) {
        self.shared.progressed.store(true, Ordering::Release);
    }

    /// Stop judging progress, e.g. while path files are written.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Judge progress again, starting with a fresh period.
    pub fn resume(&self) {
        self.shared.progressed.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Whether a divergence was recorded since the last call.
    pub fn take_divergence(&self) -> bool {
        self.shared.diverged.swap(false, Ordering::AcqRel)
    }

    /// Whether the monitor thread was started.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

fn run(shared: Arc<Shared>, period: Duration, fatal_path: Option<PathBuf>) {
    debug!(?period, fatal = fatal_path.is_some(), "divergence monitor started");
    loop {
        let deadline = Instant::now() + period;
        while Instant::now() < deadline {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(POLL_SLICE.min(period));
        }
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }
        if shared.progressed.swap(false, Ordering::AcqRel) {
            continue;
        }
        let step = shared.step.load(Ordering::Acquire);
        error!(?period, step, "no simulation progress within the divergence timeout");
        match &fatal_path {
            Some(path) => abort_stuck_run(&shared, path, step),
            None => shared.diverged.store(true, Ordering::Release),
        }
    }
}

/// The runner is stuck inside a step: dump its choices and abort.
fn abort_stuck_run(shared: &Shared, path: &Path, step: u64) -> ! {
    let choices = shared.choices.lock().clone();
    let header = format!(
        "# DIVERGENCE::step {step} exceeded the divergence timeout\n# {} choices before the step\n",
        choices.len()
    );
    match write_choices(path, header, &choices) {
        Ok(()) => error!(step, ?path, "Divergence, aborting"),
        Err(e) => error!(step, error = %e, ?path, "Divergence, aborting without an error path"),
    }
    std::process::abort()
}

impl Drop for DivergenceMonitor {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_progress_is_a_divergence() {
        let monitor = DivergenceMonitor::start(Duration::from_millis(30));
        assert!(monitor.is_running());
        assert!(!monitor.is_fatal());
        thread::sleep(Duration::from_millis(150));
        assert!(monitor.take_divergence());
    }

    #[test]
    fn test_paused_monitor_does_not_fire() {
        let monitor = DivergenceMonitor::start(Duration::from_millis(30));
        monitor.pause();
        thread::sleep(Duration::from_millis(120));
        assert!(!monitor.take_divergence());
        monitor.resume();
    }

    #[test]
    fn test_steady_progress_keeps_a_fatal_monitor_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errordivergence.path");
        let monitor = DivergenceMonitor::start_fatal(Duration::from_millis(60), path.clone());
        assert!(monitor.is_fatal());
        for step in 1..=20 {
            monitor.checkpoint(step, || Vector::unit(Choice { out_of: 2, value: 1 }));
            monitor.signal();
            thread::sleep(Duration::from_millis(10));
        }
        drop(monitor);
        assert!(!path.exists());
    }
}
