//! Candidate fixes, their measured outcomes, and ranking.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scout_protocol::{ErrorLocation, FileChange, FixSpec};
use serde::Serialize;

use crate::error::{Result, ScoutError};
use crate::shadow::resolve_in;

// ─────────────────────────────────────────────────────────────────────────────
// Fix actions
// ─────────────────────────────────────────────────────────────────────────────

/// An opaque fix that can be applied to a shadow project.
pub trait FixAction: Send + Sync {
    /// Applies the fix under `shadow_root`. The returned [`Applied::Change`]
    /// restores the previous state when reverted.
    fn apply(&self, shadow_root: &Path) -> Result<Applied>;
}

/// Undo handle for one applied fix.
pub trait Revert: Send {
    fn revert(self: Box<Self>, shadow_root: &Path) -> Result<()>;
}

pub enum Applied {
    Change(Box<dyn Revert>),
    /// The fix cannot be run against the shadow. Nothing was changed.
    Unavailable(String),
}

impl std::fmt::Debug for Applied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Applied::Change(_) => f.write_str("Applied::Change"),
            Applied::Unavailable(reason) => write!(f, "Applied::Unavailable({})", reason),
        }
    }
}

/// Replaces or deletes whole files, restoring the originals on revert.
#[derive(Debug, Clone)]
pub struct FileEditFix {
    label: String,
    changes: Vec<FileChange>,
    unavailable: bool,
}

impl FileEditFix {
    pub fn new(label: &str, changes: Vec<FileChange>) -> Self {
        Self {
            label: label.to_string(),
            changes,
            unavailable: false,
        }
    }

    /// A fix whose class cannot be exercised on the shadow.
    pub fn unavailable(label: &str) -> Self {
        Self {
            label: label.to_string(),
            changes: Vec::new(),
            unavailable: true,
        }
    }

    pub fn from_spec(spec: &FixSpec) -> Self {
        Self {
            label: spec.label.clone(),
            changes: spec.changes.clone(),
            unavailable: spec.unavailable,
        }
    }

    fn failed(&self, details: impl Into<String>) -> ScoutError {
        ScoutError::FixFailed {
            label: self.label.clone(),
            details: details.into(),
        }
    }
}

impl FixAction for FileEditFix {
    fn apply(&self, shadow_root: &Path) -> Result<Applied> {
        if self.unavailable {
            return Ok(Applied::Unavailable(format!(
                "{} cannot be applied to a shadow copy",
                self.label
            )));
        }

        let mut backup = FileBackup {
            label: self.label.clone(),
            entries: Vec::with_capacity(self.changes.len()),
        };
        for change in &self.changes {
            let target = match resolve_in(shadow_root, &change.path) {
                Ok(target) => target,
                Err(err) => {
                    backup.restore(shadow_root)?;
                    return Err(self.failed(err.to_string()));
                }
            };
            let previous = if target.is_file() {
                match fs_err::read(&target) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        backup.restore(shadow_root)?;
                        return Err(self.failed(err.to_string()));
                    }
                }
            } else {
                None
            };
            backup.entries.push((change.path.clone(), previous));

            if let Err(err) = write_change(&target, change.content.as_deref()) {
                backup.restore(shadow_root)?;
                return Err(self.failed(err.to_string()));
            }
        }
        Ok(Applied::Change(Box::new(backup)))
    }
}

fn write_change(target: &Path, content: Option<&str>) -> std::io::Result<()> {
    match content {
        Some(content) => {
            if let Some(parent) = target.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::write(target, content)
        }
        None if target.is_file() => fs_err::remove_file(target),
        None => Ok(()),
    }
}

struct FileBackup {
    label: String,
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl FileBackup {
    fn restore(&self, shadow_root: &Path) -> Result<()> {
        for (path, previous) in self.entries.iter().rev() {
            let target: PathBuf = resolve_in(shadow_root, path)?;
            let outcome = match previous {
                Some(bytes) => target
                    .parent()
                    .map(fs_err::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs_err::write(&target, bytes)),
                None if target.exists() => fs_err::remove_file(&target),
                None => Ok(()),
            };
            outcome.map_err(|err| ScoutError::RevertFailed {
                label: self.label.clone(),
                details: format!("{}: {}", path, err),
            })?;
        }
        Ok(())
    }
}

impl Revert for FileBackup {
    fn revert(self: Box<Self>, shadow_root: &Path) -> Result<()> {
        self.restore(shadow_root)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proposals
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CandidateProposal {
    label: String,
    location: ErrorLocation,
    action: Arc<dyn FixAction>,
}

impl CandidateProposal {
    pub fn new(label: &str, location: ErrorLocation, action: Arc<dyn FixAction>) -> Self {
        Self {
            label: label.to_string(),
            location,
            action,
        }
    }

    /// Builds a file-edit candidate. Specs without a location are attached to
    /// `fallback`.
    pub fn from_spec(spec: &FixSpec, fallback: &ErrorLocation) -> Self {
        Self::new(
            &spec.label,
            spec.location.clone().unwrap_or_else(|| fallback.clone()),
            Arc::new(FileEditFix::from_spec(spec)),
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn location(&self) -> &ErrorLocation {
        &self.location
    }

    pub fn action(&self) -> &dyn FixAction {
        self.action.as_ref()
    }
}

impl std::fmt::Debug for CandidateProposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateProposal")
            .field("label", &self.label)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Supplies the candidate fixes for an error location.
pub trait ProposalSource: Send + Sync {
    fn candidates(&self, location: &ErrorLocation) -> Vec<CandidateProposal>;
}

/// A fixed candidate list, filtered by location.
#[derive(Debug, Clone, Default)]
pub struct StaticProposals {
    candidates: Vec<CandidateProposal>,
}

impl StaticProposals {
    pub fn new(candidates: Vec<CandidateProposal>) -> Self {
        Self { candidates }
    }

    pub fn from_specs(specs: &[FixSpec], fallback: &ErrorLocation) -> Self {
        Self::new(
            specs
                .iter()
                .map(|spec| CandidateProposal::from_spec(spec, fallback))
                .collect(),
        )
    }
}

impl ProposalSource for StaticProposals {
    fn candidates(&self, location: &ErrorLocation) -> Vec<CandidateProposal> {
        self.candidates
            .iter()
            .filter(|candidate| {
                candidate.location.path == location.path
                    && (location.line == 0 || candidate.location.line == location.line)
            })
            .cloned()
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Error count observed after applying a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "count", rename_all = "snake_case")]
pub enum ErrorCount {
    Count(u32),
    /// The candidate could not be applied or built on the shadow.
    NotAvailable,
    /// No measurement has been attached yet.
    NotComputed,
}

impl ErrorCount {
    pub fn count(&self) -> Option<u32> {
        match self {
            ErrorCount::Count(count) => Some(*count),
            ErrorCount::NotAvailable | ErrorCount::NotComputed => None,
        }
    }

    /// Real counts ascending, then every sentinel tied.
    fn rank_key(&self) -> (u8, u32) {
        match self {
            ErrorCount::Count(count) => (0, *count),
            ErrorCount::NotAvailable | ErrorCount::NotComputed => (1, 0),
        }
    }
}

impl std::fmt::Display for ErrorCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCount::Count(count) => write!(f, "{}", count),
            ErrorCount::NotAvailable => f.write_str("n/a"),
            ErrorCount::NotComputed => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AugmentedProposal {
    proposal: CandidateProposal,
    errors_before: u32,
    errors_after: ErrorCount,
    elapsed: Duration,
}

impl AugmentedProposal {
    /// A proposal awaiting its measurement.
    pub fn pending(proposal: CandidateProposal, errors_before: u32) -> Self {
        Self {
            proposal,
            errors_before,
            errors_after: ErrorCount::NotComputed,
            elapsed: Duration::ZERO,
        }
    }

    pub fn measured(
        proposal: CandidateProposal,
        errors_before: u32,
        errors_after: ErrorCount,
        elapsed: Duration,
    ) -> Self {
        Self {
            proposal,
            errors_before,
            errors_after,
            elapsed,
        }
    }

    /// Attaches a late-arriving measurement. Returns false if one was already
    /// attached.
    pub fn attach_result(&mut self, errors_after: ErrorCount, elapsed: Duration) -> bool {
        if self.errors_after != ErrorCount::NotComputed {
            return false;
        }
        self.errors_after = errors_after;
        self.elapsed = elapsed;
        true
    }

    pub fn proposal(&self) -> &CandidateProposal {
        &self.proposal
    }

    pub fn label(&self) -> &str {
        self.proposal.label()
    }

    pub fn location(&self) -> &ErrorLocation {
        self.proposal.location()
    }

    pub fn errors_before(&self) -> u32 {
        self.errors_before
    }

    pub fn errors_after(&self) -> ErrorCount {
        self.errors_after
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Errors removed by this candidate (negative when it makes things worse).
    pub fn improvement(&self) -> Option<i64> {
        self.errors_after
            .count()
            .map(|after| i64::from(self.errors_before) - i64::from(after))
    }

    pub fn to_entry(&self, rank: usize) -> RankedEntry {
        RankedEntry {
            rank,
            label: self.label().to_string(),
            location: self.location().clone(),
            errors_before: self.errors_before,
            errors_after: self.errors_after,
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

/// Serializable view of one ranked proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub rank: usize,
    pub label: String,
    pub location: ErrorLocation,
    pub errors_before: u32,
    pub errors_after: ErrorCount,
    pub elapsed_ms: u64,
}

/// Orders proposals by ascending error count. Ties keep their input order and
/// sentinels sort after every real count.
pub fn rank(proposals: &mut [AugmentedProposal]) {
    proposals.sort_by_key(|proposal| proposal.errors_after.rank_key());
}

pub fn ranked_entries(proposals: &[AugmentedProposal]) -> Vec<RankedEntry> {
    proposals
        .iter()
        .enumerate()
        .map(|(index, proposal)| proposal.to_entry(index + 1))
        .collect()
}
