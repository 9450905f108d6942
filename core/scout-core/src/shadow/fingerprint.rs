//! Structural fingerprints of a project tree: relative file path → MD5 of the
//! file content. Two trees are in sync when their fingerprints are equal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, ScoutError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFingerprint {
    files: BTreeMap<String, String>,
}

impl ProjectFingerprint {
    /// Walks `root`, skipping any entry whose name is listed in `ignore`.
    /// Symlinks are not followed and do not contribute.
    pub fn compute(root: &Path, ignore: &[String]) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_ignored(entry, ignore));

        for entry in walker {
            let entry = entry.map_err(|err| ScoutError::Fingerprint {
                path: root.to_path_buf(),
                details: err.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let bytes = fs_err::read(entry.path())
                .map_err(|err| ScoutError::io("Failed to read file for fingerprint", err))?;
            files.insert(
                relative_key(root, entry.path()),
                format!("{:x}", md5::compute(bytes)),
            );
        }

        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn digest(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Compares `self` (the reference) against `other`.
    pub fn diff(&self, other: &ProjectFingerprint) -> FingerprintDiff {
        let mut diff = FingerprintDiff::default();
        for (path, digest) in &self.files {
            match other.files.get(path) {
                None => diff.missing.push(path.clone()),
                Some(other_digest) if other_digest != digest => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in other.files.keys() {
            if !self.files.contains_key(path) {
                diff.extra.push(path.clone());
            }
        }
        diff
    }
}

/// Paths are relative to the project root, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FingerprintDiff {
    /// Present in the reference, absent from the other tree.
    pub missing: Vec<String>,
    /// Present only in the other tree.
    pub extra: Vec<String>,
    /// Present in both with different content.
    pub changed: Vec<String>,
}

impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.changed.is_empty()
    }

    /// Every path named by the diff, in any of the three lists.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.missing
            .iter()
            .chain(&self.extra)
            .chain(&self.changed)
            .map(String::as_str)
    }

    /// The diff with every path in `excluded` removed.
    pub fn excluding(mut self, excluded: &BTreeSet<String>) -> Self {
        if !excluded.is_empty() {
            self.missing.retain(|path| !excluded.contains(path));
            self.extra.retain(|path| !excluded.contains(path));
            self.changed.retain(|path| !excluded.contains(path));
        }
        self
    }

    pub fn summary(&self) -> String {
        fn preview(paths: &[String]) -> String {
            let mut shown = paths.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
            if paths.len() > 3 {
                shown.push_str(&format!(", +{} more", paths.len() - 3));
            }
            shown
        }
        format!(
            "missing={} [{}] extra={} [{}] changed={} [{}]",
            self.missing.len(),
            preview(&self.missing),
            self.extra.len(),
            preview(&self.extra),
            self.changed.len(),
            preview(&self.changed)
        )
    }
}

pub(crate) fn is_ignored(entry: &DirEntry, ignore: &[String]) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| ignore.iter().any(|ignored| ignored == name))
        .unwrap_or(false)
}

pub(crate) fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
