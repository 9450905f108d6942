//! `scout mirror`: clone the project, replay JSON-lines edit events from stdin
//! into the clone, then compare the clone with the project on disk.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use scout_core::{
    resolve_project_identity, DirectoryCloner, Result, ScoutConfig, ScoutError,
    ShadowSynchronizer, StorageConfig, SyncOptions, SyncStats,
};
use scout_protocol::parse_edit_line;
use serde::Serialize;
use tracing::{info, warn};

pub struct MirrorArgs {
    pub project: PathBuf,
    pub snapshot: bool,
}

#[derive(Debug, Serialize)]
pub struct MirrorReport {
    pub project: String,
    pub synchronized: bool,
    pub skipped_lines: usize,
    pub stats: SyncStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

pub fn run(
    args: MirrorArgs,
    storage: &StorageConfig,
    config: &ScoutConfig,
    input: impl BufRead,
) -> Result<MirrorReport> {
    let identity = resolve_project_identity(&args.project)?;
    let sync = ShadowSynchronizer::init(
        &identity.name,
        &identity.root,
        storage.shadow_dir(identity.id.as_str()),
        Arc::new(DirectoryCloner::new(config.fingerprint.ignore.clone())),
        SyncOptions::from_config(config),
    )?;

    let mut skipped_lines = 0;
    for (index, line) in input.lines().enumerate() {
        let line = line.map_err(|err| ScoutError::io("Failed to read edit events", err))?;
        match parse_edit_line(&line) {
            Ok(Some(event)) => {
                sync.enqueue(event)?;
            }
            Ok(None) => {}
            Err(info) => {
                skipped_lines += 1;
                warn!(
                    line = index + 1,
                    code = %info.code,
                    message = %info.message,
                    "Skipping edit line"
                );
            }
        }
    }

    sync.wait_until_synchronized();
    let diff = sync.check_synchronization()?;
    let synchronized = diff.is_empty();

    let snapshot = if args.snapshot || (!synchronized && config.snapshot.on_desync) {
        let reason = if synchronized { "requested" } else { "desync" };
        Some(sync.snapshot(&storage.snapshots_dir(), reason)?)
    } else {
        None
    };

    let report = MirrorReport {
        project: identity.name.clone(),
        synchronized,
        skipped_lines,
        stats: sync.stats(),
        snapshot,
    };
    sync.stop();

    if synchronized {
        info!(
            project = %report.project,
            applied = report.stats.events_applied,
            "Shadow synchronized"
        );
        Ok(report)
    } else {
        Err(ScoutError::Desync(diff.summary()))
    }
}
