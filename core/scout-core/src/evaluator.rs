//! Speculative evaluation of candidate fixes on a frozen shadow.
//!
//! One round, in order:
//!
//! 1. drain pending edits into the shadow
//! 2. take a freeze hold and wait for the worker to park
//! 3. build once for the baseline error count
//! 4. for each candidate: apply, build, revert
//! 5. record build outputs, then compare fingerprints (only when no edits are
//!    queued)
//! 6. unfreeze, rank, and activate the session
//!
//! The hold is owned by [`Freeze`] and released exactly once however the round
//! ends. Other holders cannot release it, and a snapshot or resync waits for
//! the round to finish.

use std::path::Path;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::build::BuildService;
use crate::config::EvaluationConfig;
use crate::error::{Result, ScoutError};
use crate::proposal::{rank, Applied, AugmentedProposal, CandidateProposal, ErrorCount};
use crate::session::{InvalidationReason, Session};
use crate::shadow::{ProjectFingerprint, ShadowSynchronizer};

#[derive(Debug, Clone)]
pub enum RoundOutcome {
    Delivered(Vec<AugmentedProposal>),
    Invalidated(InvalidationReason),
}

impl RoundOutcome {
    fn of(session: &Session) -> Self {
        RoundOutcome::Invalidated(
            session
                .invalidation_reason()
                .unwrap_or(InvalidationReason::Superseded),
        )
    }
}

/// One hold on the mirroring gate, released on drop. When `track_outputs`
/// is set, the shadow is fingerprinted right after the freeze so whatever the
/// builds write can be recorded before mirroring resumes.
struct Freeze<'a> {
    sync: &'a ShadowSynchronizer,
    before: Option<ProjectFingerprint>,
    _owner: MutexGuard<'a, ()>,
}

impl<'a> Freeze<'a> {
    /// None when the synchronizer has stopped and no hold could be taken.
    fn engage(sync: &'a ShadowSynchronizer, track_outputs: bool) -> Option<Self> {
        let owner = sync.lock_shadow();
        if !sync.block() {
            return None;
        }
        let mut freeze = Self {
            sync,
            before: None,
            _owner: owner,
        };
        sync.wait_until_synchronized();
        if track_outputs {
            match sync.shadow_fingerprint() {
                Ok(fingerprint) => freeze.before = Some(fingerprint),
                Err(err) => warn!(error = %err, "Build outputs will not be tracked this round"),
            }
        }
        Some(freeze)
    }

    /// The shadow holds more than build output (an unreverted candidate);
    /// nothing may be recorded.
    fn discard_outputs(&mut self) {
        self.before = None;
    }

    fn record_outputs(&mut self) {
        if let Some(before) = self.before.take() {
            if let Err(err) = self.sync.record_build_outputs(&before) {
                warn!(error = %err, "Failed to record build outputs");
            }
        }
    }
}

impl Drop for Freeze<'_> {
    fn drop(&mut self) {
        self.record_outputs();
        self.sync.unblock();
    }
}

pub struct SpeculativeEvaluator {
    build: Arc<dyn BuildService>,
    verify_sync: bool,
}

impl SpeculativeEvaluator {
    pub fn new(build: Arc<dyn BuildService>, config: &EvaluationConfig) -> Self {
        Self {
            build,
            verify_sync: config.verify_sync_before_delivery,
        }
    }

    /// Runs one round for `session`.
    ///
    /// Returns `Err` only when the round itself failed (baseline build, or a
    /// candidate that could not be reverted); the session is invalidated with
    /// [`InvalidationReason::RoundFailed`] first.
    pub fn run_round(
        &self,
        sync: &ShadowSynchronizer,
        session: &Session,
        candidates: &[CandidateProposal],
    ) -> Result<RoundOutcome> {
        let round_started = Instant::now();
        if !session.is_valid() {
            return Ok(RoundOutcome::of(session));
        }

        sync.wait_until_synchronized();
        let Some(mut freeze) = Freeze::engage(sync, self.verify_sync) else {
            session.invalidate(InvalidationReason::Stopped);
            return Ok(RoundOutcome::of(session));
        };
        let shadow = sync.shadow_root();

        let errors_before = match self.build.build(shadow) {
            Ok(errors) => errors,
            Err(err) => {
                error!(session = session.id(), error = %err, "Baseline build failed");
                session.invalidate(InvalidationReason::RoundFailed(err.to_string()));
                return Err(err);
            }
        };
        debug!(session = session.id(), errors_before, "Baseline measured");

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !session.is_valid() {
                info!(
                    session = session.id(),
                    evaluated = results.len(),
                    "Round abandoned"
                );
                return Ok(RoundOutcome::of(session));
            }

            let mut proposal = AugmentedProposal::pending(candidate.clone(), errors_before);
            let started = Instant::now();
            let errors_after = match self.measure(shadow, candidate) {
                Ok(count) => count,
                Err(err) => {
                    error!(
                        session = session.id(),
                        label = candidate.label(),
                        error = %err,
                        "Candidate left the shadow modified"
                    );
                    freeze.discard_outputs();
                    session.invalidate(InvalidationReason::RoundFailed(err.to_string()));
                    return Err(err);
                }
            };
            proposal.attach_result(errors_after, started.elapsed());
            debug!(
                session = session.id(),
                label = candidate.label(),
                errors_after = %errors_after,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Candidate measured"
            );
            results.push(proposal);
        }

        freeze.record_outputs();
        if self.verify_sync && sync.pending_events() == 0 {
            match sync.check_synchronization() {
                Ok(diff) if !diff.is_empty() => {
                    warn!(session = session.id(), diff = %diff.summary(), "Shadow desynchronized");
                    session.invalidate(InvalidationReason::Desync(diff.summary()));
                    return Ok(RoundOutcome::of(session));
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Skipping synchronization check"),
            }
        }
        drop(freeze);

        rank(&mut results);
        if !session.activate(results.clone()) {
            return Ok(RoundOutcome::of(session));
        }
        info!(
            session = session.id(),
            candidates = results.len(),
            errors_before,
            elapsed_ms = round_started.elapsed().as_millis() as u64,
            "Round delivered"
        );
        Ok(RoundOutcome::Delivered(results))
    }

    /// Applies, builds and reverts one candidate. Only a failed revert is an
    /// error; anything else that prevents a measurement yields `NotAvailable`.
    fn measure(&self, shadow: &Path, candidate: &CandidateProposal) -> Result<ErrorCount> {
        let revert = match candidate.action().apply(shadow) {
            Ok(Applied::Change(revert)) => revert,
            Ok(Applied::Unavailable(reason)) => {
                debug!(label = candidate.label(), reason, "Candidate unavailable");
                return Ok(ErrorCount::NotAvailable);
            }
            Err(err @ ScoutError::RevertFailed { .. }) => return Err(err),
            Err(err) => {
                warn!(label = candidate.label(), error = %err, "Candidate could not be applied");
                return Ok(ErrorCount::NotAvailable);
            }
        };

        let errors_after = match self.build.build(shadow) {
            Ok(errors) => ErrorCount::Count(errors),
            Err(err) => {
                warn!(label = candidate.label(), error = %err, "Candidate build failed");
                ErrorCount::NotAvailable
            }
        };

        revert
            .revert(shadow)
            .map_err(|err| match err {
                err @ ScoutError::RevertFailed { .. } => err,
                other => ScoutError::RevertFailed {
                    label: candidate.label().to_string(),
                    details: other.to_string(),
                },
            })?;
        Ok(errors_after)
    }
}
