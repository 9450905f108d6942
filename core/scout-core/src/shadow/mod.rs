//! Shadow project mirroring.
//!
//! A [`ShadowSynchronizer`] owns a filesystem clone of a monitored project and
//! a [`BlockableWorker`] whose cycle drains the edit queue into the clone.
//!
//! ```text
//! edit source ─► enqueue (FIFO, never blocks) ─► worker cycle ─► apply_event ─► shadow tree
//!                                                    ▲
//!                       evaluator: block ─► mutate shadow ─► revert ─► unblock
//! ```
//!
//! The shadow has exactly two writers: the worker while unblocked and the
//! evaluator while blocked. A failed event is logged and dropped (or triggers a
//! re-clone, per [`ApplyFailurePolicy`]); persistent drift is only visible
//! through [`ShadowSynchronizer::test_synchronization`].
//!
//! Builds run inside the shadow and may leave files behind (a generated
//! `Cargo.lock`, for instance). Paths a build touched are recorded with
//! [`ShadowSynchronizer::record_build_outputs`] and left out of the comparison
//! until a mirrored edit or a re-clone makes them the user's again.

pub mod apply;
pub mod clone;
pub mod fingerprint;
pub mod snapshot;

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use scout_protocol::EditEvent;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ApplyFailurePolicy, ScoutConfig};
use crate::error::{Result, ScoutError};
use crate::worker::{BlockableWorker, Cycle};

pub use apply::{apply_event, resolve_in};
pub use clone::{DirectoryCloner, ProjectCloner};
pub use fingerprint::{FingerprintDiff, ProjectFingerprint};
pub use snapshot::SnapshotManifest;

const SETTLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    pub on_apply_failure: ApplyFailurePolicy,
    pub ignore: Vec<String>,
    pub max_snapshots: usize,
}

impl SyncOptions {
    pub fn from_config(config: &ScoutConfig) -> Self {
        Self {
            interval: config.sync.interval(),
            on_apply_failure: config.sync.on_apply_failure,
            ignore: config.fingerprint.ignore.clone(),
            max_snapshots: config.snapshot.max_snapshots,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&ScoutConfig::default())
    }
}

/// Counters describing what the mirroring worker has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub events_enqueued: u64,
    pub events_applied: u64,
    pub events_dropped: u64,
    pub resyncs: u64,
    pub freezes: u64,
    pub thaws: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<(u64, EditEvent)>,
    /// Sequence number of the last enqueued event.
    enqueued_seq: u64,
    /// Every event up to this sequence has been applied or dropped.
    settled_seq: u64,
    stats: SyncStats,
}

struct SyncShared {
    project: String,
    original: PathBuf,
    shadow: PathBuf,
    cloner: Arc<dyn ProjectCloner>,
    policy: ApplyFailurePolicy,
    queue: Mutex<QueueState>,
    settled: Condvar,
    build_outputs: Mutex<BTreeSet<String>>,
}

impl SyncShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_outputs(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.build_outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reclone(&self) -> Result<()> {
        self.cloner.clone_project(&self.original, &self.shadow)?;
        self.build_outputs().clear();
        info!(project = %self.project, "Shadow project re-cloned from original");
        Ok(())
    }

    fn drain_and_apply(&self) -> Result<()> {
        let batch: Vec<(u64, EditEvent)> = self.lock().pending.drain(..).collect();
        let Some(last_seq) = batch.last().map(|(seq, _)| *seq) else {
            return Ok(());
        };

        let mut applied = 0u64;
        let mut dropped = 0u64;
        let mut resync_needed = false;
        for (seq, event) in &batch {
            if resync_needed {
                dropped += 1;
                continue;
            }
            match apply_event(&self.shadow, event) {
                Ok(()) => {
                    applied += 1;
                    self.release_build_output(event);
                    debug!(
                        project = %self.project,
                        seq,
                        kind = event.kind.as_str(),
                        path = %event.path,
                        "Edit event mirrored"
                    );
                }
                Err(err) => {
                    dropped += 1;
                    warn!(
                        project = %self.project,
                        seq,
                        kind = event.kind.as_str(),
                        path = %event.path,
                        error = %err,
                        "Dropping edit event that could not be applied"
                    );
                    if self.policy == ApplyFailurePolicy::Resync {
                        resync_needed = true;
                    }
                }
            }
        }

        let resync = resync_needed.then(|| self.reclone());

        let mut state = self.lock();
        state.settled_seq = state.settled_seq.max(last_seq);
        state.stats.events_applied += applied;
        state.stats.events_dropped += dropped;
        if matches!(resync, Some(Ok(()))) {
            state.stats.resyncs += 1;
        }
        drop(state);
        self.settled.notify_all();

        match resync {
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

impl SyncShared {
    fn release_build_output(&self, event: &EditEvent) {
        let mut outputs = self.build_outputs();
        if outputs.is_empty() {
            return;
        }
        outputs.remove(&event.path);
        if let Some(new_path) = &event.new_path {
            outputs.remove(new_path);
        }
    }
}

struct MirrorCycle {
    shared: Arc<SyncShared>,
}

impl Cycle for MirrorCycle {
    fn run_cycle(&mut self) -> Result<()> {
        self.shared.drain_and_apply()
    }
}

/// Keeps a shadow copy of one project in step with the original.
pub struct ShadowSynchronizer {
    shared: Arc<SyncShared>,
    worker: BlockableWorker,
    options: SyncOptions,
    owner: Mutex<()>,
    snapshot_seq: AtomicU64,
    stopped: AtomicBool,
}

impl ShadowSynchronizer {
    /// Clones `original` into `shadow` and starts mirroring.
    pub fn init(
        project: &str,
        original: &Path,
        shadow: PathBuf,
        cloner: Arc<dyn ProjectCloner>,
        options: SyncOptions,
    ) -> Result<Self> {
        if !original.is_dir() {
            return Err(ScoutError::InvalidProjectPath {
                path: original.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }
        if let Some(parent) = shadow.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| ScoutError::io("Failed to create shadows directory", err))?;
        }
        cloner.clone_project(original, &shadow)?;

        let shared = Arc::new(SyncShared {
            project: project.to_string(),
            original: original.to_path_buf(),
            shadow,
            cloner,
            policy: options.on_apply_failure,
            queue: Mutex::new(QueueState::default()),
            settled: Condvar::new(),
            build_outputs: Mutex::new(BTreeSet::new()),
        });
        let worker = BlockableWorker::new(
            format!("shadow-{}", project),
            options.interval,
            MirrorCycle {
                shared: Arc::clone(&shared),
            },
        );
        worker.start()?;

        info!(
            project,
            original = %shared.original.display(),
            shadow = %shared.shadow.display(),
            "Shadow synchronizer started"
        );
        Ok(Self {
            shared,
            worker,
            options,
            owner: Mutex::new(()),
            snapshot_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn project(&self) -> &str {
        &self.shared.project
    }

    pub fn original(&self) -> &Path {
        &self.shared.original
    }

    pub fn shadow_root(&self) -> &Path {
        &self.shared.shadow
    }

    /// Appends an event to the apply queue and returns its sequence number.
    pub fn enqueue(&self, event: EditEvent) -> Result<u64> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ScoutError::ProjectNotMonitored(self.shared.project.clone()));
        }
        event.validate()?;
        let mut state = self.shared.lock();
        state.enqueued_seq += 1;
        let seq = state.enqueued_seq;
        state.stats.events_enqueued += 1;
        state.pending.push_back((seq, event));
        Ok(seq)
    }

    pub fn pending_events(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Takes a hold on the mirroring gate; mirroring stays frozen after the
    /// in-flight cycle until every hold is released. Each `true` must be
    /// paired with exactly one [`unblock`](Self::unblock). Returns false once
    /// the synchronizer has stopped.
    pub fn block(&self) -> bool {
        let changed = self.worker.block();
        if changed {
            self.shared.lock().stats.freezes += 1;
        }
        changed
    }

    /// Releases one hold. Mirroring resumes when the last hold is released.
    /// Returns false if no hold was outstanding.
    pub fn unblock(&self) -> bool {
        let changed = self.worker.unblock();
        if changed {
            self.shared.lock().stats.thaws += 1;
        }
        changed
    }

    pub fn is_blocked(&self) -> bool {
        self.worker.is_blocked()
    }

    /// Exclusive use of the shadow besides the mirroring worker. An evaluation
    /// round holds it for its whole length; [`snapshot`](Self::snapshot) and
    /// [`resync`](Self::resync) take it too, so they wait for the round.
    pub fn lock_shadow(&self) -> MutexGuard<'_, ()> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unblocked: waits until every event queued before the call has been
    /// applied (or dropped). Blocked: waits until the worker is parked; queued
    /// events stay queued.
    pub fn wait_until_synchronized(&self) {
        self.wait_synchronized(None);
    }

    pub fn wait_until_synchronized_timeout(&self, timeout: Duration) -> bool {
        self.wait_synchronized(Some(Instant::now() + timeout))
    }

    fn wait_synchronized(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.shared.lock();
        let target = state.enqueued_seq;
        while state.settled_seq < target {
            if self.worker.is_blocked() || !self.worker.is_alive() {
                break;
            }
            let slice = match deadline {
                None => SETTLE_POLL,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    SETTLE_POLL.min(deadline - now)
                }
            };
            state = match self.shared.settled.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(state);

        if self.worker.is_blocked() {
            return match deadline {
                None => {
                    self.worker.wait_until_synchronized();
                    true
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.worker.wait_until_synchronized_timeout(remaining)
                }
            };
        }
        true
    }

    /// Compares the original against the shadow, leaving out recorded build
    /// outputs.
    pub fn check_synchronization(&self) -> Result<FingerprintDiff> {
        let original = ProjectFingerprint::compute(&self.shared.original, &self.options.ignore)?;
        let shadow = self.shadow_fingerprint()?;
        Ok(original.diff(&shadow).excluding(&self.shared.build_outputs()))
    }

    pub fn shadow_fingerprint(&self) -> Result<ProjectFingerprint> {
        ProjectFingerprint::compute(&self.shared.shadow, &self.options.ignore)
    }

    /// Records every path that differs between `before` and the shadow as it
    /// is now. Call while blocked, with `before` taken after the freeze, so
    /// the only writers in between were builds and reverted candidates.
    /// Returns how many paths were newly recorded.
    pub fn record_build_outputs(&self, before: &ProjectFingerprint) -> Result<usize> {
        let diff = before.diff(&self.shadow_fingerprint()?);
        if diff.is_empty() {
            return Ok(0);
        }
        let mut outputs = self.shared.build_outputs();
        let recorded = diff
            .paths()
            .filter(|path| outputs.insert(path.to_string()))
            .count();
        if recorded > 0 {
            debug!(
                project = %self.shared.project,
                recorded,
                outputs = %diff.summary(),
                "Build outputs recorded"
            );
        }
        Ok(recorded)
    }

    /// Shadow paths written by builds rather than mirrored from the original.
    pub fn build_outputs(&self) -> Vec<String> {
        self.shared.build_outputs().iter().cloned().collect()
    }

    /// True when shadow and original have the same structural fingerprint.
    /// A false result means an event was missed, duplicated or misordered.
    pub fn test_synchronization(&self) -> bool {
        match self.check_synchronization() {
            Ok(diff) if diff.is_empty() => true,
            Ok(diff) => {
                warn!(
                    project = %self.shared.project,
                    summary = %diff.summary(),
                    "Shadow project out of sync"
                );
                false
            }
            Err(err) => {
                warn!(
                    project = %self.shared.project,
                    error = %err,
                    "Failed to compare shadow with original"
                );
                false
            }
        }
    }

    /// Archives the current shadow under `destination`, with mirroring frozen
    /// for the duration of the copy.
    pub fn snapshot(&self, destination: &Path, reason: &str) -> Result<PathBuf> {
        let _owner = self.lock_shadow();
        let froze_here = self.block();
        self.worker.wait_until_synchronized();

        let result = self.next_snapshot_sequence(destination).and_then(|sequence| {
            snapshot::write_snapshot(
                &self.shared.shadow,
                destination,
                &self.shared.project,
                sequence,
                reason,
                &self.options.ignore,
            )
        });

        if froze_here {
            self.unblock();
        }

        if result.is_ok() {
            let keep = self.options.max_snapshots;
            if let Err(err) = snapshot::prune_snapshots(destination, &self.shared.project, keep) {
                warn!(error = %err, "Failed to prune old snapshots");
            }
        }
        result
    }

    /// One past the highest sequence seen by this synchronizer or found among
    /// the archives already in `destination`.
    fn next_snapshot_sequence(&self, destination: &Path) -> Result<u64> {
        let on_disk = snapshot::latest_sequence(destination, &self.shared.project)?;
        let sequence = self.snapshot_seq.load(Ordering::SeqCst).max(on_disk) + 1;
        self.snapshot_seq.fetch_max(sequence, Ordering::SeqCst);
        Ok(sequence)
    }

    /// Discards pending events and re-clones the shadow from the original.
    pub fn resync(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ScoutError::ProjectNotMonitored(self.shared.project.clone()));
        }
        let _owner = self.lock_shadow();
        let froze_here = self.block();
        self.worker.wait_until_synchronized();

        {
            let mut state = self.shared.lock();
            let discarded = state.pending.len() as u64;
            state.pending.clear();
            state.settled_seq = state.enqueued_seq;
            state.stats.events_dropped += discarded;
        }
        self.shared.settled.notify_all();

        let result = self.shared.reclone();
        if result.is_ok() {
            self.shared.lock().stats.resyncs += 1;
        }

        if froze_here {
            self.unblock();
        }
        result
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.lock().stats
    }

    /// Kills and joins the worker, then removes the shadow tree. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.worker.kill_and_join();
        self.shared.settled.notify_all();

        if self.shared.shadow.exists() {
            if let Err(err) = fs_err::remove_dir_all(&self.shared.shadow) {
                warn!(
                    project = %self.shared.project,
                    error = %err,
                    "Failed to remove shadow project"
                );
            }
        }
        info!(project = %self.shared.project, "Shadow synchronizer stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ShadowSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
