//! Background worker primitives.
//!
//! A [`PeriodicWorker`] owns one OS thread that sleeps for its interval and
//! then runs one [`Cycle`], forever, until killed. A [`BlockableWorker`] adds a
//! gate consulted at the top of every loop iteration, so mirroring can be
//! frozen while somebody else owns the shadow project.
//!
//! ```text
//!  loop: sleep(interval) ─► gate (blockable only) ─► working ─► cycle ─► idle ─► notify
//!            ▲   kill wakes the sleep and the gate; one final cycle still runs   │
//!            └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State lives behind a `Mutex` + `Condvar` pair per worker; control signals
//! (`kill`, `block`, `unblock`) never wait on the worker.

mod blockable;
mod periodic;

pub use blockable::BlockableWorker;
pub use periodic::{Cycle, PeriodicWorker};
