//! Periodic background passes.
//!
//! Each [`PeriodicTask`] owns one tokio interval loop. A pass runs on the
//! blocking pool (providers do synchronous I/O) and is awaited up to the
//! configured timeout. Ticks that arrive while a pass is still running are
//! skipped, including a pass that outlived its timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("no tokio runtime is running")]
    NoRuntime,
}

pub type Pass = Arc<dyn Fn() + Send + Sync>;

/// Clears the busy flag when the pass returns or panics.
struct ResetOnDrop(Arc<AtomicBool>);

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    timeout: Duration,
    busy: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration, timeout: Duration) -> Self {
        Self {
            name,
            interval,
            timeout,
            busy: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ticks skipped because the previous pass had not finished.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Starts the loop. The first pass runs immediately. Returns `Ok(false)`
    /// if the task is already running.
    pub fn start(&self, pass: Pass) -> Result<bool, SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }
        *handle = Some(runtime.spawn(run_loop(
            self.name,
            self.interval,
            self.timeout,
            self.busy.clone(),
            self.skipped.clone(),
            pass,
        )));
        debug!(task = self.name, interval_ms = self.interval.as_millis() as u64, "task started");
        Ok(true)
    }

    /// Stops the loop. A pass already on the blocking pool runs to completion.
    /// Returns `false` if the task was not running.
    pub fn stop(&self) -> bool {
        match self.handle().take() {
            Some(h) => {
                let was_running = !h.is_finished();
                h.abort();
                debug!(task = self.name, "task stopped");
                was_running
            }
            None => false,
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(h) = self.handle().take() {
            h.abort();
        }
    }
}

async fn run_loop(
    name: &'static str,
    interval: Duration,
    timeout: Duration,
    busy: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    pass: Pass,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        if busy.swap(true, Ordering::AcqRel) {
            skipped.fetch_add(1, Ordering::Relaxed);
            debug!(task = name, "previous pass still running, tick skipped");
            continue;
        }

        let reset = ResetOnDrop(busy.clone());
        let pass = pass.clone();
        let t0 = Instant::now();
        let job = tokio::task::spawn_blocking(move || {
            let _reset = reset;
            pass();
        });

        match tokio::time::timeout(timeout, job).await {
            Ok(Ok(())) => {
                let elapsed = t0.elapsed();
                debug!(task = name, duration_ms = elapsed.as_millis() as u64, "pass completed");
                if elapsed > interval / 2 {
                    warn!(
                        task = name,
                        duration_ms = elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        "pass exceeded 50% of interval"
                    );
                }
            }
            Ok(Err(e)) => error!(task = name, error = %e, "pass panicked"),
            Err(_) => warn!(
                task = name,
                timeout_ms = timeout.as_millis() as u64,
                "pass timed out; later ticks are skipped until it finishes"
            ),
        }
    }
}
