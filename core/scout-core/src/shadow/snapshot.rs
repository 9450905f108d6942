//! Shadow snapshot archives for postmortem debugging.
//!
//! # Layout
//!
//! ```text
//! {snapshots_dir}/{project}-{YYYYmmddTHHMMSS}-{seq}/
//! ├── files/          # copy of the shadow tree
//! └── manifest.json   # { project, created_at, sequence, reason, files: {path: md5} }
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clone::copy_tree;
use super::fingerprint::ProjectFingerprint;
use crate::error::{Result, ScoutError};

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";
const STAMP_LEN: usize = "YYYYmmddTHHMMSS".len();

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub project: String,
    pub created_at: String,
    pub sequence: u64,
    pub reason: String,
    pub files: BTreeMap<String, String>,
}

pub fn snapshot_name(project: &str, sequence: u64) -> String {
    format!(
        "{}-{}-{:04}",
        sanitize(project),
        Utc::now().format("%Y%m%dT%H%M%S"),
        sequence
    )
}

/// Copies `shadow_root` into a fresh archive under `destination`.
///
/// `sequence` is the first number tried; if an archive with that name already
/// exists the next free number is used, so an existing archive is never
/// overwritten.
pub fn write_snapshot(
    shadow_root: &Path,
    destination: &Path,
    project: &str,
    sequence: u64,
    reason: &str,
    ignore: &[String],
) -> Result<PathBuf> {
    let (archive, sequence) = claim_archive(destination, project, sequence)?;
    let copied = copy_tree(shadow_root, &archive.join(FILES_DIR), ignore)?;

    let fingerprint = ProjectFingerprint::compute(shadow_root, ignore)?;
    let manifest = SnapshotManifest {
        project: project.to_string(),
        created_at: Utc::now().to_rfc3339(),
        sequence,
        reason: reason.to_string(),
        files: fingerprint
            .files()
            .map(|(path, digest)| (path.to_string(), digest.to_string()))
            .collect(),
    };
    let payload = serde_json::to_vec_pretty(&manifest).map_err(|err| ScoutError::Json {
        context: "Failed to serialize snapshot manifest".to_string(),
        source: err,
    })?;
    let manifest_path = archive.join(MANIFEST_FILE);
    let tmp_path = manifest_path.with_extension("tmp");
    fs_err::write(&tmp_path, payload)
        .map_err(|err| ScoutError::io("Failed to write snapshot manifest", err))?;
    fs_err::rename(&tmp_path, &manifest_path)
        .map_err(|err| ScoutError::io("Failed to commit snapshot manifest", err))?;

    info!(
        project,
        sequence,
        reason,
        files = copied,
        archive = %archive.display(),
        "Shadow snapshot written"
    );
    Ok(archive)
}

pub fn read_manifest(archive: &Path) -> Result<SnapshotManifest> {
    let content = fs_err::read(archive.join(MANIFEST_FILE))
        .map_err(|err| ScoutError::io("Failed to read snapshot manifest", err))?;
    serde_json::from_slice(&content).map_err(|err| ScoutError::Json {
        context: "Failed to parse snapshot manifest".to_string(),
        source: err,
    })
}

/// Creates the archive directory, skipping sequence numbers already taken.
fn claim_archive(destination: &Path, project: &str, first: u64) -> Result<(PathBuf, u64)> {
    fs_err::create_dir_all(destination)
        .map_err(|err| ScoutError::io("Failed to create snapshots directory", err))?;
    let mut sequence = first;
    loop {
        let archive = destination.join(snapshot_name(project, sequence));
        match fs_err::create_dir(&archive) {
            Ok(()) => return Ok((archive, sequence)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => sequence += 1,
            Err(err) => return Err(ScoutError::io("Failed to create snapshot archive", err)),
        }
    }
}

/// Highest sequence number among the existing archives of `project`, or 0.
pub fn latest_sequence(destination: &Path, project: &str) -> Result<u64> {
    Ok(list_archives(destination, project)?
        .into_iter()
        .map(|(_, sequence)| sequence)
        .max()
        .unwrap_or(0))
}

/// Archives of `project` with their sequence numbers, oldest first.
fn list_archives(destination: &Path, project: &str) -> Result<Vec<(PathBuf, u64)>> {
    if !destination.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}-", sanitize(project));
    let mut archives: Vec<(PathBuf, u64)> = fs_err::read_dir(destination)
        .map_err(|err| ScoutError::io("Failed to list snapshots", err))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let sequence = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| archive_sequence(name, &prefix))?;
            Some((path, sequence))
        })
        .collect();
    archives.sort();
    Ok(archives)
}

/// Parses `{prefix}{stamp}-{seq}`. Names of other projects sharing the
/// prefix (`demo-api-...` for `demo`) do not parse.
fn archive_sequence(name: &str, prefix: &str) -> Option<u64> {
    let (stamp, sequence) = name.strip_prefix(prefix)?.rsplit_once('-')?;
    if stamp.len() != STAMP_LEN || !stamp.contains('T') || stamp.contains('-') {
        return None;
    }
    sequence.parse().ok()
}

/// Removes the oldest archives of `project`, keeping at most `keep`.
/// Returns how many were removed.
pub fn prune_snapshots(destination: &Path, project: &str, keep: usize) -> Result<usize> {
    let archives = list_archives(destination, project)?;
    if archives.len() <= keep {
        return Ok(0);
    }
    let excess = archives.len() - keep;
    let mut removed = 0;
    for (archive, _) in archives.into_iter().take(excess) {
        match fs_err::remove_dir_all(&archive) {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(error = %err, archive = %archive.display(), "Failed to prune snapshot")
            }
        }
    }
    Ok(removed)
}

fn sanitize(project: &str) -> String {
    let cleaned: String = project
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}
