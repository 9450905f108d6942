//! Integration tests for mirroring, speculative rounds, and session validity.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use scout_core::{
    resolve_project_identity, Applied, BuildService, CandidateProposal, DirectoryCloner,
    ErrorCount, EvaluationConfig, FileEditFix, FixAction, InvalidationReason, MonitorRunner,
    Result, Revert, RoundOutcome, ScoutConfig, ScoutError, Session, SessionState,
    ShadowSynchronizer, SpeculativeEvaluator, StaticProposals, StorageConfig, SyncOptions,
};
use scout_protocol::{EditEvent, ErrorLocation, FileChange};
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(10);

/// Reads the error count from `errors.txt` in the built tree.
#[derive(Default)]
struct CountingBuild {
    builds: AtomicUsize,
}

impl BuildService for CountingBuild {
    fn build(&self, project: &Path) -> Result<u32> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let text = fs_err::read_to_string(project.join("errors.txt"))
            .map_err(|err| ScoutError::BuildFailed(err.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| ScoutError::BuildFailed(format!("bad error count: {}", text)))
    }
}

/// Signals when a build starts and holds it until released.
struct GatedBuild {
    inner: CountingBuild,
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl BuildService for GatedBuild {
    fn build(&self, project: &Path) -> Result<u32> {
        let _ = self.started.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv_timeout(WAIT);
        self.inner.build(project)
    }
}

/// Regenerates a lockfile in the built tree before counting, as `cargo check`
/// does for a project without a committed `Cargo.lock`.
#[derive(Default)]
struct LockfileBuild {
    inner: CountingBuild,
}

impl BuildService for LockfileBuild {
    fn build(&self, project: &Path) -> Result<u32> {
        let generation = self.inner.builds.load(Ordering::SeqCst);
        fs_err::write(project.join("Cargo.lock"), format!("# generation {}", generation))
            .map_err(|err| ScoutError::BuildFailed(err.to_string()))?;
        self.inner.build(project)
    }
}

fn gated_build() -> (Arc<GatedBuild>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let build = Arc::new(GatedBuild {
        inner: CountingBuild::default(),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    (build, started_rx, release_tx)
}

struct BrokenRevertFix;

struct BrokenRevert;

impl Revert for BrokenRevert {
    fn revert(self: Box<Self>, _shadow_root: &Path) -> Result<()> {
        Err(ScoutError::RevertFailed {
            label: "broken".to_string(),
            details: "disk vanished".to_string(),
        })
    }
}

impl FixAction for BrokenRevertFix {
    fn apply(&self, shadow_root: &Path) -> Result<Applied> {
        fs_err::write(shadow_root.join("errors.txt"), "9")
            .map_err(|err| ScoutError::FixFailed {
                label: "broken".to_string(),
                details: err.to_string(),
            })?;
        Ok(Applied::Change(Box::new(BrokenRevert)))
    }
}

struct RecordingFix {
    applied: Arc<AtomicBool>,
}

impl FixAction for RecordingFix {
    fn apply(&self, _shadow_root: &Path) -> Result<Applied> {
        self.applied.store(true, Ordering::SeqCst);
        Ok(Applied::Unavailable("recorded".to_string()))
    }
}

fn location() -> ErrorLocation {
    ErrorLocation::new("src/lib.rs", 1)
}

fn fix(label: &str, errors: u32) -> CandidateProposal {
    CandidateProposal::new(
        label,
        location(),
        Arc::new(FileEditFix::new(
            label,
            vec![FileChange {
                path: "errors.txt".to_string(),
                content: Some(errors.to_string()),
            }],
        )),
    )
}

fn project_with_errors(errors: u32) -> TempDir {
    let project = tempdir().unwrap();
    fs_err::create_dir_all(project.path().join("src")).unwrap();
    fs_err::write(project.path().join("src/lib.rs"), "pub fn broken() {}").unwrap();
    fs_err::write(project.path().join("errors.txt"), errors.to_string()).unwrap();
    project
}

fn fast_config() -> ScoutConfig {
    let mut config = ScoutConfig::default();
    config.sync.interval_ms = 2;
    config
}

fn synchronizer(original: &Path, scratch: &Path) -> ShadowSynchronizer {
    ShadowSynchronizer::init(
        "demo",
        original,
        scratch.join("shadow"),
        Arc::new(DirectoryCloner::default()),
        SyncOptions::from_config(&fast_config()),
    )
    .unwrap()
}

fn counts(results: &[scout_core::AugmentedProposal]) -> Vec<ErrorCount> {
    results.iter().map(|r| r.errors_after()).collect()
}

#[test]
fn mirrored_edits_leave_shadow_synchronized() {
    let project = project_with_errors(0);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());

    let edits = [
        EditEvent::create("src/new.rs", "pub fn new() {}"),
        EditEvent::modify("src/lib.rs", "pub fn fixed() {}"),
        EditEvent::rename("src/new.rs", "src/renamed.rs"),
        EditEvent::delete("errors.txt"),
    ];
    fs_err::write(project.path().join("src/lib.rs"), "pub fn fixed() {}").unwrap();
    fs_err::write(project.path().join("src/renamed.rs"), "pub fn new() {}").unwrap();
    fs_err::remove_file(project.path().join("errors.txt")).unwrap();
    for edit in edits {
        sync.enqueue(edit).unwrap();
    }

    assert!(sync.wait_until_synchronized_timeout(WAIT));
    assert!(sync.test_synchronization());
    let stats = sync.stats();
    assert_eq!(stats.events_enqueued, 4);
    assert_eq!(stats.events_applied, 4);
    assert_eq!(stats.events_dropped, 0);
}

#[test]
fn round_ranks_candidates_by_remaining_errors() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let build = Arc::new(CountingBuild::default());
    let evaluator = SpeculativeEvaluator::new(build.clone(), &EvaluationConfig::default());

    let session = Session::new(1, location());
    let candidates = vec![fix("c1", 2), fix("c2", 0), fix("c3", 1)];
    let outcome = evaluator.run_round(&sync, &session, &candidates).unwrap();

    let results = match outcome {
        RoundOutcome::Delivered(results) => results,
        other => panic!("round not delivered: {:?}", other),
    };
    let labels: Vec<&str> = results.iter().map(|r| r.label()).collect();
    assert_eq!(labels, vec!["c2", "c3", "c1"]);
    assert_eq!(
        counts(&results),
        vec![ErrorCount::Count(0), ErrorCount::Count(1), ErrorCount::Count(2)]
    );
    assert!(results.iter().all(|r| r.errors_before() == 1));

    assert!(session.is_active());
    assert_eq!(session.results().map(|r| r.len()), Some(3));
    assert_eq!(build.builds.load(Ordering::SeqCst), 4);

    assert_eq!(
        fs_err::read_to_string(sync.shadow_root().join("errors.txt")).unwrap(),
        "1"
    );
    assert!(sync.test_synchronization());
    assert!(!sync.is_blocked());
    let stats = sync.stats();
    assert_eq!(stats.freezes, 1);
    assert_eq!(stats.thaws, 1);
}

#[test]
fn unavailable_candidates_rank_last() {
    let project = project_with_errors(3);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let evaluator =
        SpeculativeEvaluator::new(Arc::new(CountingBuild::default()), &EvaluationConfig::default());

    let session = Session::new(1, location());
    let candidates = vec![
        CandidateProposal::new(
            "refactor",
            location(),
            Arc::new(FileEditFix::unavailable("refactor")),
        ),
        fix("worse", 5),
    ];
    let results = match evaluator.run_round(&sync, &session, &candidates).unwrap() {
        RoundOutcome::Delivered(results) => results,
        other => panic!("round not delivered: {:?}", other),
    };
    assert_eq!(
        counts(&results),
        vec![ErrorCount::Count(5), ErrorCount::NotAvailable]
    );
    assert_eq!(results[0].improvement(), Some(-2));
}

#[test]
fn revert_failure_aborts_round_and_unfreezes_once() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let evaluator =
        SpeculativeEvaluator::new(Arc::new(CountingBuild::default()), &EvaluationConfig::default());

    let third_applied = Arc::new(AtomicBool::new(false));
    let candidates = vec![
        fix("c1", 0),
        CandidateProposal::new("c2", location(), Arc::new(BrokenRevertFix)),
        CandidateProposal::new(
            "c3",
            location(),
            Arc::new(RecordingFix {
                applied: Arc::clone(&third_applied),
            }),
        ),
    ];
    let session = Session::new(1, location());
    let err = evaluator
        .run_round(&sync, &session, &candidates)
        .unwrap_err();

    assert!(matches!(err, ScoutError::RevertFailed { .. }));
    assert!(!third_applied.load(Ordering::SeqCst));
    assert_eq!(session.state(), SessionState::Invalidated);
    assert!(matches!(
        session.invalidation_reason(),
        Some(InvalidationReason::RoundFailed(_))
    ));
    assert!(session.results().is_none());

    assert!(!sync.is_blocked());
    let stats = sync.stats();
    assert_eq!(stats.freezes, 1);
    assert_eq!(stats.thaws, 1);

    // The unreverted change stays visible as drift.
    assert!(sync.build_outputs().is_empty());
    assert!(!sync.test_synchronization());
}

#[test]
fn files_written_by_builds_do_not_desynchronize_rounds() {
    let project = project_with_errors(2);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let evaluator =
        SpeculativeEvaluator::new(Arc::new(LockfileBuild::default()), &EvaluationConfig::default());

    for id in 1..=2 {
        let session = Session::new(id, location());
        let outcome = evaluator
            .run_round(&sync, &session, &[fix("c1", 0), fix("c2", 1)])
            .unwrap();
        match outcome {
            RoundOutcome::Delivered(results) => assert_eq!(
                counts(&results),
                vec![ErrorCount::Count(0), ErrorCount::Count(1)]
            ),
            other => panic!("round {} not delivered: {:?}", id, other),
        }
        assert!(session.is_active());
        assert_eq!(sync.build_outputs(), vec!["Cargo.lock".to_string()]);
        assert!(sync.test_synchronization());

        sync.resync().unwrap();
        assert!(sync.build_outputs().is_empty());
    }
}

#[test]
fn runner_keeps_delivering_when_builds_write_into_the_shadow() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let runner = runner(
        project.path(),
        scratch.path(),
        Arc::new(LockfileBuild::default()),
        vec![fix("c1", 0)],
    );

    for _ in 0..2 {
        let session = runner.request_evaluation(location()).unwrap();
        let ranked = session
            .wait_until_activated_timeout(WAIT)
            .expect("round not delivered");
        assert_eq!(counts(&ranked), vec![ErrorCount::Count(0)]);
    }
    assert_eq!(runner.synchronizer().stats().resyncs, 0);
    runner.stop();
}

#[test]
fn foreign_unblock_during_round_does_not_resume_mirroring() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let (build, started_rx, release_tx) = gated_build();
    let evaluator = SpeculativeEvaluator::new(build.clone(), &EvaluationConfig::default());
    let session = Session::new(1, location());

    // Someone else already froze mirroring when the round starts.
    assert!(sync.block());

    let outcome = std::thread::scope(|scope| {
        let round = scope.spawn(|| evaluator.run_round(&sync, &session, &[fix("c1", 0)]));

        started_rx.recv_timeout(WAIT).expect("baseline build never started");
        release_tx.send(()).unwrap();
        started_rx.recv_timeout(WAIT).expect("candidate build never started");

        // The other holder lets go and an edit arrives mid-candidate.
        assert!(sync.unblock());
        assert!(sync.is_blocked());
        fs_err::write(project.path().join("errors.txt"), "42").unwrap();
        sync.enqueue(EditEvent::modify("errors.txt", "42")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            fs_err::read_to_string(sync.shadow_root().join("errors.txt")).unwrap(),
            "0"
        );

        release_tx.send(()).unwrap();
        round.join().unwrap()
    });

    match outcome.unwrap() {
        RoundOutcome::Delivered(results) => {
            assert_eq!(counts(&results), vec![ErrorCount::Count(0)])
        }
        other => panic!("round not delivered: {:?}", other),
    }
    assert!(!sync.is_blocked());
    assert!(sync.wait_until_synchronized_timeout(WAIT));
    assert_eq!(
        fs_err::read_to_string(sync.shadow_root().join("errors.txt")).unwrap(),
        "42"
    );
    assert!(sync.test_synchronization());
}

#[test]
fn invalidated_session_is_not_evaluated() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let sync = synchronizer(project.path(), scratch.path());
    let build = Arc::new(CountingBuild::default());
    let evaluator = SpeculativeEvaluator::new(build.clone(), &EvaluationConfig::default());

    let session = Session::new(1, location());
    session.invalidate(InvalidationReason::Superseded);
    let outcome = evaluator
        .run_round(&sync, &session, &[fix("c1", 0)])
        .unwrap();

    assert!(matches!(
        outcome,
        RoundOutcome::Invalidated(InvalidationReason::Superseded)
    ));
    assert_eq!(build.builds.load(Ordering::SeqCst), 0);
    assert_eq!(sync.stats().freezes, 0);
}

fn runner(
    project: &Path,
    scratch: &Path,
    build: Arc<dyn BuildService>,
    candidates: Vec<CandidateProposal>,
) -> MonitorRunner {
    let storage = StorageConfig::with_root(scratch.to_path_buf());
    MonitorRunner::start(
        resolve_project_identity(project).unwrap(),
        &storage,
        &fast_config(),
        Arc::new(DirectoryCloner::default()),
        build,
        Arc::new(StaticProposals::new(candidates)),
    )
    .unwrap()
}

#[test]
fn edit_during_round_invalidates_session() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let (build, started_rx, release_tx) = gated_build();
    let runner = runner(
        project.path(),
        scratch.path(),
        build.clone(),
        vec![fix("c1", 0), fix("c2", 2)],
    );

    let session = runner.request_evaluation(location()).unwrap();
    started_rx
        .recv_timeout(WAIT)
        .expect("baseline build never started");

    fs_err::write(project.path().join("src/lib.rs"), "pub fn edited() {}").unwrap();
    runner
        .notify_edit(EditEvent::modify("src/lib.rs", "pub fn edited() {}"))
        .unwrap();
    drop(release_tx);
    runner.wait_for_rounds();

    assert_eq!(session.state(), SessionState::Invalidated);
    assert_eq!(
        session.invalidation_reason(),
        Some(InvalidationReason::ProjectEdited)
    );
    assert!(runner.ranked_results(&session).is_none());
    assert!(session.wait_until_activated_timeout(WAIT).is_none());
    assert_eq!(build.inner.builds.load(Ordering::SeqCst), 1);

    let sync = runner.synchronizer();
    assert!(!sync.is_blocked());
    assert!(sync.wait_until_synchronized_timeout(WAIT));
    assert!(sync.test_synchronization());
    runner.stop();
}

#[test]
fn newer_request_supersedes_previous_session() {
    let project = project_with_errors(2);
    let scratch = tempdir().unwrap();
    let runner = runner(
        project.path(),
        scratch.path(),
        Arc::new(CountingBuild::default()),
        vec![fix("c1", 1), fix("c2", 0)],
    );

    let first = runner.request_evaluation(location()).unwrap();
    let second = runner.request_evaluation(location()).unwrap();

    let ranked = second
        .wait_until_activated_timeout(WAIT)
        .expect("second round not delivered");
    assert_eq!(
        counts(&ranked),
        vec![ErrorCount::Count(0), ErrorCount::Count(1)]
    );
    assert_eq!(
        first.invalidation_reason(),
        Some(InvalidationReason::Superseded)
    );
    assert!(runner.ranked_results(&first).is_none());
    assert_eq!(runner.current_session().map(|s| s.id()), Some(second.id()));
    runner.stop();
}

#[test]
fn desync_is_snapshotted_and_resynchronized() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let runner = runner(
        project.path(),
        scratch.path(),
        Arc::new(CountingBuild::default()),
        vec![fix("c1", 0)],
    );

    // Changed on disk without an edit event.
    fs_err::write(project.path().join("src/lib.rs"), "pub fn drifted() {}").unwrap();
    let session = runner.request_evaluation(location()).unwrap();
    runner.wait_for_rounds();

    assert!(matches!(
        session.invalidation_reason(),
        Some(InvalidationReason::Desync(_))
    ));
    let snapshots: Vec<_> = fs_err::read_dir(scratch.path().join("snapshots"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(snapshots.len(), 1);

    let sync = runner.synchronizer();
    assert!(sync.test_synchronization());
    assert_eq!(sync.stats().resyncs, 1);
    runner.stop();
}

#[test]
fn stop_invalidates_current_session_and_removes_shadow() {
    let project = project_with_errors(1);
    let scratch = tempdir().unwrap();
    let runner = runner(
        project.path(),
        scratch.path(),
        Arc::new(CountingBuild::default()),
        vec![fix("c1", 0)],
    );
    let shadow = runner.synchronizer().shadow_root().to_path_buf();
    assert!(shadow.is_dir());

    let session = runner.request_evaluation(location()).unwrap();
    session.wait_until_activated_timeout(WAIT);
    runner.stop();

    assert_eq!(
        session.invalidation_reason(),
        Some(InvalidationReason::Stopped)
    );
    assert!(!shadow.exists());
    assert!(matches!(
        runner.request_evaluation(location()),
        Err(ScoutError::ProjectNotMonitored(_))
    ));
    assert!(runner.notify_edit(EditEvent::delete("errors.txt")).is_err());
}
