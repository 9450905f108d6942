//! Validity token for one evaluation round.
//!
//! ```text
//! Pending ──activate──► Active
//!    │                    │
//!    └──invalidate──► Invalidated ◄──invalidate──┘
//! ```
//!
//! Invalidation is terminal: once invalidated, `activate` is a no-op and the
//! ranked list is dropped, so a stale ranking can never be read back.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scout_protocol::ErrorLocation;
use serde::Serialize;
use tracing::debug;

use crate::proposal::AugmentedProposal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Active,
    Invalidated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Invalidated => "invalidated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "details", rename_all = "snake_case")]
pub enum InvalidationReason {
    /// A newer round was requested for the same project.
    Superseded,
    /// An edit event arrived while the round was running.
    ProjectEdited,
    /// Shadow and original fingerprints diverged.
    Desync(String),
    /// A candidate could not be reverted, or the baseline build failed.
    RoundFailed(String),
    /// Monitoring stopped.
    Stopped,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Superseded => f.write_str("superseded by a newer round"),
            InvalidationReason::ProjectEdited => f.write_str("project edited during the round"),
            InvalidationReason::Desync(details) => write!(f, "shadow desynchronized: {}", details),
            InvalidationReason::RoundFailed(details) => write!(f, "round failed: {}", details),
            InvalidationReason::Stopped => f.write_str("monitoring stopped"),
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    results: Option<Vec<AugmentedProposal>>,
    reason: Option<InvalidationReason>,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    location: ErrorLocation,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    changed: Condvar,
}

impl Session {
    pub fn new(id: u64, location: ErrorLocation) -> Self {
        Self {
            id,
            location,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                results: None,
                reason: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &ErrorLocation {
        &self.location
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_valid(&self) -> bool {
        self.state() != SessionState::Invalidated
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn invalidation_reason(&self) -> Option<InvalidationReason> {
        self.lock().reason.clone()
    }

    /// Delivers a ranked list. Calling it again on an active session attaches
    /// the newer list. Returns false (and drops `results`) once invalidated.
    pub fn activate(&self, results: Vec<AugmentedProposal>) -> bool {
        let mut inner = self.lock();
        if inner.state == SessionState::Invalidated {
            return false;
        }
        inner.state = SessionState::Active;
        inner.results = Some(results);
        drop(inner);
        self.changed.notify_all();
        debug!(session = self.id, "Session activated");
        true
    }

    /// Moves the session to `Invalidated`. Returns true only for the call that
    /// performed the transition; the first reason wins.
    pub fn invalidate(&self, reason: InvalidationReason) -> bool {
        let mut inner = self.lock();
        if inner.state == SessionState::Invalidated {
            return false;
        }
        debug!(session = self.id, reason = %reason, "Session invalidated");
        inner.state = SessionState::Invalidated;
        inner.results = None;
        inner.reason = Some(reason);
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// The ranked list, if the session is active.
    pub fn results(&self) -> Option<Vec<AugmentedProposal>> {
        let inner = self.lock();
        match inner.state {
            SessionState::Active => inner.results.clone(),
            SessionState::Pending | SessionState::Invalidated => None,
        }
    }

    /// Blocks until the session is active (returning the ranked list) or
    /// invalidated (returning `None`).
    pub fn wait_until_activated(&self) -> Option<Vec<AugmentedProposal>> {
        self.wait_activated(None)
    }

    /// Like [`wait_until_activated`](Self::wait_until_activated); also returns
    /// `None` when `timeout` elapses while still pending.
    pub fn wait_until_activated_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Vec<AugmentedProposal>> {
        self.wait_activated(Some(Instant::now() + timeout))
    }

    fn wait_activated(&self, deadline: Option<Instant>) -> Option<Vec<AugmentedProposal>> {
        let mut inner = self.lock();
        loop {
            match inner.state {
                SessionState::Active => return inner.results.clone(),
                SessionState::Invalidated => return None,
                SessionState::Pending => {}
            }
            inner = match deadline {
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    match self.changed.wait_timeout(inner, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn session() -> Session {
        Session::new(1, ErrorLocation::new("src/lib.rs", 3))
    }

    #[test]
    fn starts_pending_and_valid() {
        let session = session();
        assert_eq!(session.state(), SessionState::Pending);
        assert!(session.is_valid());
        assert!(!session.is_active());
        assert!(session.results().is_none());
    }

    #[test]
    fn activate_delivers_results() {
        let session = session();
        assert!(session.activate(Vec::new()));
        assert!(session.is_active());
        assert!(session.is_valid());
        assert_eq!(session.results().map(|r| r.len()), Some(0));
    }

    #[test]
    fn invalidation_is_monotonic() {
        let session = session();
        assert!(session.invalidate(InvalidationReason::ProjectEdited));
        assert!(!session.invalidate(InvalidationReason::Stopped));
        assert!(!session.activate(Vec::new()));

        assert!(!session.is_valid());
        assert!(!session.is_active());
        assert!(session.results().is_none());
        assert_eq!(
            session.invalidation_reason(),
            Some(InvalidationReason::ProjectEdited)
        );
    }

    #[test]
    fn invalidating_active_session_discards_results() {
        let session = session();
        session.activate(Vec::new());
        assert!(session.invalidate(InvalidationReason::Superseded));
        assert!(session.results().is_none());
        assert_eq!(session.state(), SessionState::Invalidated);
    }

    #[test]
    fn waiter_is_released_by_invalidate() {
        let session = Arc::new(session());
        let waiter = Arc::clone(&session);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(waiter.wait_until_activated().is_some());
        });

        thread::sleep(Duration::from_millis(20));
        session.invalidate(InvalidationReason::Stopped);
        let activated = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("waiter hung after invalidate");
        assert!(!activated);
    }

    #[test]
    fn waiter_is_released_by_activate() {
        let session = Arc::new(session());
        let waiter = Arc::clone(&session);
        let handle = thread::spawn(move || waiter.wait_until_activated());
        thread::sleep(Duration::from_millis(20));
        session.activate(Vec::new());
        assert!(handle.join().unwrap().is_some());
    }

    #[test]
    fn wait_with_timeout_gives_up_while_pending() {
        let session = session();
        assert!(session
            .wait_until_activated_timeout(Duration::from_millis(10))
            .is_none());
        assert_eq!(session.state(), SessionState::Pending);
    }
}
