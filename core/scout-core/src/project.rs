use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, ScoutError};

/// Stable identity of a monitored project: MD5 of its canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectIdentity {
    pub id: ProjectId,
    pub name: String,
    pub root: PathBuf,
}

pub fn resolve_project_identity(path: &Path) -> Result<ProjectIdentity> {
    if !path.is_dir() {
        return Err(ScoutError::InvalidProjectPath {
            path: path.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }
    let root = fs_err::canonicalize(path).map_err(|err| ScoutError::InvalidProjectPath {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let source = root.to_string_lossy().to_string();
    #[cfg(target_os = "macos")]
    let source = source.to_lowercase();
    let id = ProjectId(format!("{:x}", md5::compute(source)));
    let name = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "project".to_string());
    Ok(ProjectIdentity { id, name, root })
}
