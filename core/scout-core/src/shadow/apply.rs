//! Applying edit events to a shadow tree.

use std::path::{Component, Path, PathBuf};

use scout_protocol::{EditEvent, EditKind};

use crate::error::{Result, ScoutError};

/// Resolves a project-relative path inside `root`, refusing anything that
/// would land outside it.
pub fn resolve_in(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let escapes = relative.trim().is_empty()
        || candidate.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes {
        return Err(ScoutError::PathOutsideShadow(relative.to_string()));
    }
    Ok(root.join(candidate))
}

/// Applies one event to the tree rooted at `root`.
///
/// `create`/`modify` write the full content; `modify`, `delete` and `rename`
/// fail when their target does not exist.
pub fn apply_event(root: &Path, event: &EditEvent) -> Result<()> {
    let target = resolve_in(root, &event.path)?;
    let fail = |details: String| ScoutError::ApplyFailed {
        kind: event.kind.as_str().to_string(),
        path: event.path.clone(),
        details,
    };

    match event.kind {
        EditKind::Create | EditKind::Modify => {
            if event.kind == EditKind::Modify && !target.is_file() {
                return Err(fail("resource missing".to_string()));
            }
            let content = event
                .content
                .as_deref()
                .ok_or_else(|| fail("content missing".to_string()))?;
            if let Some(parent) = target.parent() {
                fs_err::create_dir_all(parent).map_err(|err| fail(err.to_string()))?;
            }
            fs_err::write(&target, content).map_err(|err| fail(err.to_string()))
        }
        EditKind::Delete => {
            if target.is_dir() {
                fs_err::remove_dir_all(&target).map_err(|err| fail(err.to_string()))
            } else if target.exists() {
                fs_err::remove_file(&target).map_err(|err| fail(err.to_string()))
            } else {
                Err(fail("resource missing".to_string()))
            }
        }
        EditKind::Rename => {
            let new_path = event
                .new_path
                .as_deref()
                .ok_or_else(|| fail("new_path missing".to_string()))?;
            let destination = resolve_in(root, new_path)?;
            if !target.exists() {
                return Err(fail("resource missing".to_string()));
            }
            if let Some(parent) = destination.parent() {
                fs_err::create_dir_all(parent).map_err(|err| fail(err.to_string()))?;
            }
            fs_err::rename(&target, &destination).map_err(|err| fail(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_nested_file() {
        let root = tempdir().unwrap();
        apply_event(root.path(), &EditEvent::create("src/a/b.rs", "fn b() {}")).unwrap();
        assert_eq!(
            fs_err::read_to_string(root.path().join("src/a/b.rs")).unwrap(),
            "fn b() {}"
        );
    }

    #[test]
    fn modify_requires_existing_file() {
        let root = tempdir().unwrap();
        let err = apply_event(root.path(), &EditEvent::modify("x.rs", "y")).unwrap_err();
        assert!(matches!(err, ScoutError::ApplyFailed { .. }));

        fs_err::write(root.path().join("x.rs"), "old").unwrap();
        apply_event(root.path(), &EditEvent::modify("x.rs", "new")).unwrap();
        assert_eq!(fs_err::read_to_string(root.path().join("x.rs")).unwrap(), "new");
    }

    #[test]
    fn delete_removes_files_and_directories() {
        let root = tempdir().unwrap();
        fs_err::create_dir_all(root.path().join("dir/inner")).unwrap();
        fs_err::write(root.path().join("dir/inner/f"), "x").unwrap();
        fs_err::write(root.path().join("g"), "y").unwrap();

        apply_event(root.path(), &EditEvent::delete("g")).unwrap();
        apply_event(root.path(), &EditEvent::delete("dir")).unwrap();
        assert!(!root.path().join("g").exists());
        assert!(!root.path().join("dir").exists());

        assert!(apply_event(root.path(), &EditEvent::delete("g")).is_err());
    }

    #[test]
    fn rename_moves_into_new_directory() {
        let root = tempdir().unwrap();
        fs_err::write(root.path().join("old.rs"), "body").unwrap();
        apply_event(root.path(), &EditEvent::rename("old.rs", "moved/new.rs")).unwrap();
        assert!(!root.path().join("old.rs").exists());
        assert_eq!(
            fs_err::read_to_string(root.path().join("moved/new.rs")).unwrap(),
            "body"
        );

        assert!(apply_event(root.path(), &EditEvent::rename("old.rs", "again.rs")).is_err());
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let root = tempdir().unwrap();
        assert!(resolve_in(root.path(), "../etc/passwd").is_err());
        assert!(resolve_in(root.path(), "/abs").is_err());
        assert!(resolve_in(root.path(), "").is_err());
        assert!(resolve_in(root.path(), "ok/file.rs").is_ok());
    }
}
