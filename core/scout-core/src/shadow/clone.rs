//! Project cloning. The engine only needs "make `destination` a faithful copy
//! of `original`"; how that happens is up to the [`ProjectCloner`].

use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use super::fingerprint::{is_ignored, relative_key};
use crate::error::{Result, ScoutError};

pub trait ProjectCloner: Send + Sync {
    /// Replaces whatever is at `destination` with a copy of `original`.
    fn clone_project(&self, original: &Path, destination: &Path) -> Result<()>;
}

/// Plain recursive copy, skipping ignored names (build output, VCS dirs).
#[derive(Debug, Clone, Default)]
pub struct DirectoryCloner {
    ignore: Vec<String>,
}

impl DirectoryCloner {
    pub fn new(ignore: Vec<String>) -> Self {
        Self { ignore }
    }
}

impl ProjectCloner for DirectoryCloner {
    fn clone_project(&self, original: &Path, destination: &Path) -> Result<()> {
        if !original.is_dir() {
            return Err(ScoutError::CloneFailed {
                original: original.to_path_buf(),
                destination: destination.to_path_buf(),
                details: "original is not a directory".to_string(),
            });
        }
        if destination.exists() {
            fs_err::remove_dir_all(destination)
                .map_err(|err| ScoutError::io("Failed to clear shadow directory", err))?;
        }
        let copied = copy_tree(original, destination, &self.ignore)?;
        debug!(
            original = %original.display(),
            destination = %destination.display(),
            files = copied,
            "Project cloned"
        );
        Ok(())
    }
}

/// Copies the tree under `from` into `to`. Returns the number of files copied.
pub(crate) fn copy_tree(from: &Path, to: &Path, ignore: &[String]) -> Result<usize> {
    fs_err::create_dir_all(to)
        .map_err(|err| ScoutError::io("Failed to create copy destination", err))?;

    let mut copied = 0;
    let walker = WalkDir::new(from)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry, ignore));

    for entry in walker {
        let entry = entry.map_err(|err| ScoutError::CloneFailed {
            original: from.to_path_buf(),
            destination: to.to_path_buf(),
            details: err.to_string(),
        })?;
        let target = to.join(relative_key(from, entry.path()));
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs_err::create_dir_all(&target)
                .map_err(|err| ScoutError::io("Failed to create directory", err))?;
        } else if file_type.is_file() {
            fs_err::copy(entry.path(), &target)
                .map_err(|err| ScoutError::io("Failed to copy file", err))?;
            copied += 1;
        }
    }

    Ok(copied)
}
