use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, ScoutError};

/// One bounded unit of background work.
///
/// A returned error (or a panic) only ends the current cycle; the worker keeps
/// running.
pub trait Cycle: Send + 'static {
    fn run_cycle(&mut self) -> Result<()>;
}

impl<F> Cycle for F
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    fn run_cycle(&mut self) -> Result<()> {
        self()
    }
}

#[derive(Debug, Default)]
pub(super) struct ControlState {
    pub(super) started: bool,
    pub(super) alive: bool,
    pub(super) working: bool,
    pub(super) exited: bool,
    pub(super) gated: bool,
    /// Outstanding `block` calls; the gate is closed while this is non-zero.
    pub(super) holds: u32,
    pub(super) cycles: u64,
    pub(super) failures: u64,
}

impl ControlState {
    pub(super) fn blocked(&self) -> bool {
        self.holds > 0
    }
}

#[derive(Debug, Default)]
pub(super) struct Control {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl Control {
    pub(super) fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ControlState>) -> MutexGuard<'a, ControlState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, ControlState>,
        timeout: Duration,
    ) -> MutexGuard<'a, ControlState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(super) fn notify(&self) {
        self.changed.notify_all();
    }
}

/// Runs a [`Cycle`] every `interval` on a dedicated thread until killed.
pub struct PeriodicWorker {
    name: String,
    interval: Duration,
    control: Arc<Control>,
    body: Mutex<Option<Box<dyn Cycle>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWorker {
    pub fn new(name: impl Into<String>, interval: Duration, body: impl Cycle) -> Self {
        Self::with_gate(name, interval, body, false)
    }

    pub(super) fn with_gate(
        name: impl Into<String>,
        interval: Duration,
        body: impl Cycle,
        gated: bool,
    ) -> Self {
        let control = Control::default();
        control.lock().gated = gated;
        Self {
            name: name.into(),
            interval,
            control: Arc::new(control),
            body: Mutex::new(Some(Box::new(body))),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn control(&self) -> &Control {
        &self.control
    }

    /// Spawns the worker thread. Starting twice, or after `kill`, is a no-op.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.control.lock();
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.alive = true;
        }

        let Some(body) = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let control = Arc::clone(&self.control);
        let name = self.name.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name(format!("scout-{}", self.name))
            .spawn(move || run_loop(&name, interval, &control, body));

        match spawned {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!(
                    worker = %self.name,
                    interval_ms = self.interval.as_millis() as u64,
                    "Worker started"
                );
                Ok(())
            }
            Err(err) => {
                let mut state = self.control.lock();
                state.alive = false;
                state.exited = true;
                self.control.notify();
                Err(ScoutError::WorkerStart {
                    name: self.name.clone(),
                    details: err.to_string(),
                })
            }
        }
    }

    /// Requests a stop without waiting. Also releases a blocked worker.
    pub fn kill(&self) {
        let mut state = self.control.lock();
        if !state.started {
            state.started = true;
            state.exited = true;
        }
        if state.alive {
            debug!(worker = %self.name, "Worker kill requested");
        }
        state.alive = false;
        state.holds = 0;
        self.control.notify();
    }

    /// Requests a stop and waits until the worker thread has terminated.
    pub fn kill_and_join(&self) {
        self.kill();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) if handle.thread().id() != thread::current().id() => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "Worker thread terminated abnormally");
                }
                info!(worker = %self.name, "Worker joined");
            }
            Some(_) => {}
            None => {
                // Another caller owns the join; wait for the exit flag instead.
                let mut state = self.control.lock();
                while !state.exited {
                    state = self.control.wait(state);
                }
            }
        }
    }

    /// Blocks until the worker completes its in-flight or next cycle.
    ///
    /// For a blocked [`BlockableWorker`](super::BlockableWorker) this returns as
    /// soon as the worker is parked. Returns immediately for a worker that was
    /// never started or has exited.
    pub fn wait_until_synchronized(&self) {
        self.wait_synchronized(None);
    }

    /// Like [`wait_until_synchronized`](Self::wait_until_synchronized), giving
    /// up after `timeout`. Returns whether the synchronization point was reached.
    pub fn wait_until_synchronized_timeout(&self, timeout: Duration) -> bool {
        self.wait_synchronized(Some(Instant::now() + timeout))
    }

    fn wait_synchronized(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.control.lock();
        let target = state.cycles + 1;
        loop {
            if !state.started || state.exited {
                return true;
            }
            let synchronized = if state.gated && state.blocked() {
                !state.working
            } else {
                state.cycles >= target
            };
            if synchronized {
                return true;
            }
            state = match deadline {
                None => self.control.wait(state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.control.wait_timeout(state, deadline - now)
                }
            };
        }
    }

    pub fn is_alive(&self) -> bool {
        self.control.lock().alive
    }

    pub fn is_working(&self) -> bool {
        self.control.lock().working
    }

    pub fn cycles_completed(&self) -> u64 {
        self.control.lock().cycles
    }

    /// Cycles that ended in an error or a panic.
    pub fn failed_cycles(&self) -> u64 {
        self.control.lock().failures
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.kill_and_join();
    }
}

fn run_loop(name: &str, interval: Duration, control: &Control, mut body: Box<dyn Cycle>) {
    loop {
        let mut state = control.lock();
        let deadline = Instant::now() + interval;
        while state.alive {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = control.wait_timeout(state, deadline - now);
        }

        if state.gated && state.blocked() && state.alive {
            debug!(worker = %name, "Worker parked");
            while state.blocked() && state.alive {
                state = control.wait(state);
            }
            debug!(worker = %name, "Worker resumed");
        }

        let final_cycle = !state.alive;
        state.working = true;
        drop(state);

        let failed = match panic::catch_unwind(AssertUnwindSafe(|| body.run_cycle())) {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                warn!(worker = %name, error = %err, "Worker cycle failed; continuing");
                true
            }
            Err(payload) => {
                warn!(
                    worker = %name,
                    panic = %panic_message(payload.as_ref()),
                    "Worker cycle panicked; continuing"
                );
                true
            }
        };

        let mut state = control.lock();
        state.working = false;
        state.cycles += 1;
        if failed {
            state.failures += 1;
        }
        let exit = final_cycle || !state.alive;
        if exit {
            state.exited = true;
        }
        control.notify();
        if exit {
            break;
        }
    }
    debug!(worker = %name, "Worker exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn counting_worker(interval: Duration) -> (PeriodicWorker, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let worker = PeriodicWorker::new("count", interval, move || -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (worker, count)
    }

    #[test]
    fn runs_cycles_until_killed() {
        let (worker, count) = counting_worker(Duration::from_millis(1));
        worker.start().unwrap();
        for _ in 0..3 {
            assert!(worker.wait_until_synchronized_timeout(Duration::from_secs(5)));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);

        worker.kill_and_join();
        assert!(!worker.is_alive());
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[test]
    fn failing_cycle_does_not_kill_worker() {
        let worker = PeriodicWorker::new("fails", Duration::from_millis(1), || -> Result<()> {
            Err(ScoutError::BuildFailed("boom".to_string()))
        });
        worker.start().unwrap();
        assert!(worker.wait_until_synchronized_timeout(Duration::from_secs(5)));
        assert!(worker.wait_until_synchronized_timeout(Duration::from_secs(5)));
        assert!(worker.is_alive());
        assert!(worker.failed_cycles() >= 2);
        worker.kill_and_join();
    }

    #[test]
    fn panicking_cycle_does_not_kill_worker() {
        let worker = PeriodicWorker::new("panics", Duration::from_millis(1), || -> Result<()> {
            panic!("cycle exploded")
        });
        worker.start().unwrap();
        assert!(worker.wait_until_synchronized_timeout(Duration::from_secs(5)));
        assert!(worker.wait_until_synchronized_timeout(Duration::from_secs(5)));
        assert!(worker.is_alive());
        worker.kill_and_join();
    }

    #[test]
    fn kill_and_join_waits_for_in_flight_cycle() {
        let (started_tx, started_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicUsize::new(0));
        let finished_flag = Arc::clone(&finished);
        let cycle_count = Arc::clone(&cycles);
        let worker = PeriodicWorker::new("slow", Duration::from_millis(1), move || -> Result<()> {
            cycle_count.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(100));
            finished_flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        worker.start().unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        worker.kill_and_join();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kill_during_sleep_runs_one_final_cycle() {
        let (worker, count) = counting_worker(Duration::from_secs(30));
        worker.start().unwrap();
        let started = Instant::now();
        worker.kill_and_join();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_on_unstarted_worker_returns_immediately() {
        let (worker, count) = counting_worker(Duration::from_millis(1));
        worker.wait_until_synchronized();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_after_kill_is_noop() {
        let (worker, count) = counting_worker(Duration::from_millis(1));
        worker.kill();
        worker.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!worker.is_alive());
    }
}
