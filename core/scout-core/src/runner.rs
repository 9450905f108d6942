//! Per-project monitor: one shadow, one evaluator, and the current session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use scout_protocol::{EditEvent, ErrorLocation};
use tracing::{error, info, warn};

use crate::build::BuildService;
use crate::config::ScoutConfig;
use crate::error::{Result, ScoutError};
use crate::evaluator::{RoundOutcome, SpeculativeEvaluator};
use crate::project::ProjectIdentity;
use crate::proposal::{AugmentedProposal, ProposalSource};
use crate::session::{InvalidationReason, Session};
use crate::shadow::{ProjectCloner, ShadowSynchronizer, SyncOptions};
use crate::storage::StorageConfig;

/// Everything a round thread needs, shared with the runner.
#[derive(Clone)]
struct RoundContext {
    sync: Arc<ShadowSynchronizer>,
    evaluator: Arc<SpeculativeEvaluator>,
    proposals: Arc<dyn ProposalSource>,
    round_lock: Arc<Mutex<()>>,
    snapshots_dir: PathBuf,
    snapshot_on_desync: bool,
}

impl RoundContext {
    fn run(&self, session: &Session) {
        let _round = self
            .round_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !session.is_valid() {
            return;
        }

        let candidates = self.proposals.candidates(session.location());
        match self.evaluator.run_round(&self.sync, session, &candidates) {
            Ok(RoundOutcome::Delivered(_)) => {}
            Ok(RoundOutcome::Invalidated(InvalidationReason::Desync(details))) => {
                self.recover_from_desync(&details);
            }
            Ok(RoundOutcome::Invalidated(reason)) => {
                info!(session = session.id(), reason = %reason, "Round discarded");
            }
            Err(err) => {
                error!(session = session.id(), error = %err, "Round failed");
            }
        }
    }

    fn recover_from_desync(&self, details: &str) {
        if self.snapshot_on_desync {
            if let Err(err) = self.sync.snapshot(&self.snapshots_dir, details) {
                warn!(error = %err, "Failed to snapshot desynchronized shadow");
            }
        }
        if let Err(err) = self.sync.resync() {
            error!(error = %err, "Failed to resynchronize shadow");
        }
    }
}

/// Monitors one project: mirrors its edits into a shadow and evaluates
/// candidate fixes on request.
pub struct MonitorRunner {
    identity: ProjectIdentity,
    context: RoundContext,
    current: Mutex<Option<Arc<Session>>>,
    rounds: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
    stopped: AtomicBool,
}

impl MonitorRunner {
    pub fn start(
        identity: ProjectIdentity,
        storage: &StorageConfig,
        config: &ScoutConfig,
        cloner: Arc<dyn ProjectCloner>,
        build: Arc<dyn BuildService>,
        proposals: Arc<dyn ProposalSource>,
    ) -> Result<Self> {
        let sync = ShadowSynchronizer::init(
            &identity.name,
            &identity.root,
            storage.shadow_dir(identity.id.as_str()),
            cloner,
            SyncOptions::from_config(config),
        )?;
        info!(project = %identity.name, id = %identity.id, "Monitoring started");

        Ok(Self {
            identity,
            context: RoundContext {
                sync: Arc::new(sync),
                evaluator: Arc::new(SpeculativeEvaluator::new(build, &config.evaluation)),
                proposals,
                round_lock: Arc::new(Mutex::new(())),
                snapshots_dir: storage.snapshots_dir(),
                snapshot_on_desync: config.snapshot.on_desync,
            },
            current: Mutex::new(None),
            rounds: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rounds(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.rounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ScoutError::ProjectNotMonitored(self.identity.name.clone()));
        }
        Ok(())
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn synchronizer(&self) -> &ShadowSynchronizer {
        &self.context.sync
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.current().clone()
    }

    /// Records an edit to the original project. Any session that has not
    /// been invalidated yet is now stale.
    pub fn notify_edit(&self, event: EditEvent) -> Result<u64> {
        self.ensure_running()?;
        event.validate()?;
        if let Some(session) = self.current().as_ref() {
            session.invalidate(InvalidationReason::ProjectEdited);
        }
        self.context.sync.enqueue(event)
    }

    /// Starts a round for `location` in the background, superseding any
    /// previous session.
    pub fn request_evaluation(&self, location: ErrorLocation) -> Result<Arc<Session>> {
        self.ensure_running()?;
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, location));

        if let Some(previous) = self.current().replace(Arc::clone(&session)) {
            previous.invalidate(InvalidationReason::Superseded);
        }

        let context = self.context.clone();
        let worker_session = Arc::clone(&session);
        let handle = thread::Builder::new()
            .name(format!("scout-round-{}", id))
            .spawn(move || context.run(&worker_session))
            .map_err(|err| {
                session.invalidate(InvalidationReason::RoundFailed(err.to_string()));
                ScoutError::WorkerStart {
                    name: format!("round-{}", id),
                    details: err.to_string(),
                }
            })?;

        let mut rounds = self.rounds();
        rounds.retain(|round| !round.is_finished());
        rounds.push(handle);
        Ok(session)
    }

    /// The ranked list of `session`, or `None` unless it is active.
    pub fn ranked_results(&self, session: &Session) -> Option<Vec<AugmentedProposal>> {
        session.results()
    }

    /// Blocks until every round started so far has finished.
    pub fn wait_for_rounds(&self) {
        let handles: Vec<_> = self.rounds().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(project = %self.identity.name, "Round thread panicked");
            }
        }
    }

    /// Invalidates the current session, waits for rounds, and tears down the
    /// shadow. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.current().take() {
            session.invalidate(InvalidationReason::Stopped);
        }
        self.wait_for_rounds();
        self.context.sync.stop();
        info!(project = %self.identity.name, "Monitoring stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for MonitorRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
