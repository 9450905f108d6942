//! Storage configuration and path management for scout.
//!
//! All on-disk locations (shadow copies, snapshot archives, logs, config) are
//! derived from a single root so tests can point everything at a temp dir.

use std::path::{Path, PathBuf};

use crate::error::{Result, ScoutError};

/// Central configuration for all scout storage paths.
///
/// Production code uses `StorageConfig::from_home()` which points to `~/.scout/`.
/// Tests use `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or(ScoutError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(".scout"),
        })
    }

    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent directory of every shadow replica (`{root}/shadows`).
    pub fn shadows_dir(&self) -> PathBuf {
        self.root.join("shadows")
    }

    /// Shadow replica location for one project, keyed by project id.
    pub fn shadow_dir(&self, project_id: &str) -> PathBuf {
        self.shadows_dir().join(project_id)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}
