use std::time::Duration;

use tracing::debug;

use super::periodic::{Cycle, PeriodicWorker};
use crate::error::Result;

/// A [`PeriodicWorker`] whose loop can be paused between cycles.
///
/// The gate is only consulted before a cycle starts: `block` never interrupts
/// a cycle already running. Synchronized means blocked *and* idle, so a waiter
/// knows no new cycle will start behind its back. `kill` clears the gate so a
/// parked worker can always be joined.
///
/// The gate is counted: every successful `block` takes a hold and the worker
/// stays parked until each hold has been released by its own `unblock`.
pub struct BlockableWorker {
    inner: PeriodicWorker,
}

impl BlockableWorker {
    pub fn new(name: impl Into<String>, interval: Duration, body: impl Cycle) -> Self {
        Self {
            inner: PeriodicWorker::with_gate(name, interval, body, true),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    pub fn kill(&self) {
        self.inner.kill();
    }

    pub fn kill_and_join(&self) {
        self.inner.kill_and_join();
    }

    /// Takes a hold on the gate. Returns false only if the worker is no longer
    /// alive, in which case no hold was taken.
    pub fn block(&self) -> bool {
        let control = self.inner.control();
        let mut state = control.lock();
        if state.started && !state.alive {
            return false;
        }
        state.holds += 1;
        control.notify();
        debug!(worker = %self.inner.name(), holds = state.holds, "Worker blocked");
        true
    }

    /// Releases one hold. Returns false if no hold was outstanding.
    pub fn unblock(&self) -> bool {
        let control = self.inner.control();
        let mut state = control.lock();
        if state.holds == 0 {
            return false;
        }
        state.holds -= 1;
        control.notify();
        debug!(worker = %self.inner.name(), holds = state.holds, "Worker unblocked");
        true
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.control().lock().blocked()
    }

    pub fn holds(&self) -> u32 {
        self.inner.control().lock().holds
    }

    /// Blocked with no cycle in flight.
    pub fn is_parked(&self) -> bool {
        let state = self.inner.control().lock();
        state.blocked() && !state.working
    }

    /// Unblocked: waits for the in-flight or next cycle. Blocked: waits until
    /// the in-flight cycle (if any) has finished and the worker is parked.
    pub fn wait_until_synchronized(&self) {
        self.inner.wait_until_synchronized();
    }

    pub fn wait_until_synchronized_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait_until_synchronized_timeout(timeout)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    pub fn is_working(&self) -> bool {
        self.inner.is_working()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles_completed()
    }

    pub fn failed_cycles(&self) -> u64 {
        self.inner.failed_cycles()
    }
}
