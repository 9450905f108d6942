//! Wire types shared between scout and the collaborators that feed it.
//!
//! Edit sources push [`EditEvent`]s (one JSON object per line), proposal
//! sources describe fixes as [`FixSpec`]s. The engine remains the authority on
//! validation, but producers can reuse the same types to build valid payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path};

pub const MAX_EVENT_CONTENT_BYTES: usize = 8 * 1024 * 1024; // 8MB
pub const MAX_EVENT_ID_LEN: usize = 128;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Create,
    Modify,
    Delete,
    Rename,
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditKind::Create => "create",
            EditKind::Modify => "modify",
            EditKind::Delete => "delete",
            EditKind::Rename => "rename",
        }
    }
}

/// One recorded change to a resource of the monitored project.
///
/// Paths are relative to the project root. `content` carries the full new
/// file content for `create`/`modify`; `new_path` is the destination of a
/// `rename`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EditEvent {
    pub event_id: String,
    pub recorded_at: String,
    pub kind: EditKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
}

impl EditEvent {
    fn stamped(kind: EditKind, path: &str) -> Self {
        Self {
            event_id: ulid::Ulid::new().to_string(),
            recorded_at: Utc::now().to_rfc3339(),
            kind,
            path: path.to_string(),
            content: None,
            new_path: None,
        }
    }

    pub fn create(path: &str, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::stamped(EditKind::Create, path)
        }
    }

    pub fn modify(path: &str, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::stamped(EditKind::Modify, path)
        }
    }

    pub fn delete(path: &str) -> Self {
        Self::stamped(EditKind::Delete, path)
    }

    pub fn rename(path: &str, new_path: &str) -> Self {
        Self {
            new_path: Some(new_path.to_string()),
            ..Self::stamped(EditKind::Rename, path)
        }
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.recorded_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if self.recorded_at().is_none() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        require_relative_path(&self.path, "path")?;

        if let Some(content) = &self.content {
            if content.len() > MAX_EVENT_CONTENT_BYTES {
                return Err(ErrorInfo::new(
                    "content_too_large",
                    "content exceeded maximum size",
                ));
            }
        }

        match self.kind {
            EditKind::Create | EditKind::Modify => {
                if self.content.is_none() {
                    return Err(ErrorInfo::new(
                        "missing_field",
                        format!("content is required for {}", self.kind.as_str()),
                    ));
                }
            }
            EditKind::Delete => {
                if self.content.is_some() {
                    return Err(ErrorInfo::new(
                        "unexpected_field",
                        "content is not allowed for delete",
                    ));
                }
            }
            EditKind::Rename => match &self.new_path {
                Some(new_path) => {
                    require_relative_path(new_path, "new_path")?;
                    if new_path == &self.path {
                        return Err(ErrorInfo::new(
                            "invalid_path",
                            "new_path must differ from path",
                        ));
                    }
                }
                None => {
                    return Err(ErrorInfo::new(
                        "missing_field",
                        "new_path is required for rename",
                    ))
                }
            },
        }

        Ok(())
    }
}

pub fn parse_edit_event(params: Value) -> Result<EditEvent, ErrorInfo> {
    let event: EditEvent = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("edit event payload is invalid JSON: {}", err),
        )
    })?;
    event.validate()?;
    Ok(event)
}

/// Parses one line of a JSON-lines edit stream. Blank lines yield `None`.
pub fn parse_edit_line(line: &str) -> Result<Option<EditEvent>, ErrorInfo> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("edit line was not valid JSON: {}", err),
        )
    })?;
    parse_edit_event(value).map(Some)
}

/// Where an error was reported in the monitored project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ErrorLocation {
    pub path: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub message: String,
}

impl ErrorLocation {
    pub fn new(path: &str, line: u32) -> Self {
        Self {
            path: path.to_string(),
            line,
            message: String::new(),
        }
    }

    /// Parses `path:line` (line optional).
    pub fn parse(value: &str) -> Result<Self, ErrorInfo> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ErrorInfo::new("invalid_location", "location is empty"));
        }
        match value.rsplit_once(':') {
            Some((path, line)) if !path.is_empty() => {
                let line = line.parse::<u32>().map_err(|_| {
                    ErrorInfo::new("invalid_location", format!("bad line number: {}", line))
                })?;
                Ok(Self::new(path, line))
            }
            _ => Ok(Self::new(value, 0)),
        }
    }
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// A file replacement inside a fix. `content: None` deletes the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Description of one candidate fix as handed over by a proposal source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FixSpec {
    pub label: String,
    #[serde(default)]
    pub location: Option<ErrorLocation>,
    #[serde(default)]
    pub changes: Vec<FileChange>,
    /// The fix class cannot be run against the shadow copy.
    #[serde(default)]
    pub unavailable: bool,
}

impl FixSpec {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.label.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "label is required"));
        }
        if self.changes.is_empty() && !self.unavailable {
            return Err(ErrorInfo::new(
                "missing_field",
                format!("fix '{}' has no changes", self.label),
            ));
        }
        for change in &self.changes {
            require_relative_path(&change.path, "changes.path")?;
        }
        Ok(())
    }
}

pub fn parse_fix_specs(payload: &str) -> Result<Vec<FixSpec>, ErrorInfo> {
    let specs: Vec<FixSpec> = serde_json::from_str(payload).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("candidate list is invalid JSON: {}", err),
        )
    })?;
    for spec in &specs {
        spec.validate()?;
    }
    Ok(specs)
}

fn require_relative_path(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    let path = Path::new(value);
    let escapes = path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(ErrorInfo::new(
            "invalid_path",
            format!("{} must stay inside the project: {}", field, value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(kind: EditKind) -> EditEvent {
        EditEvent {
            event_id: "evt-1".to_string(),
            recorded_at: "2026-01-30T12:00:00Z".to_string(),
            kind,
            path: "src/lib.rs".to_string(),
            content: Some("fn main() {}".to_string()),
            new_path: None,
        }
    }

    #[test]
    fn validates_modify_event() {
        assert!(base_event(EditKind::Modify).validate().is_ok());
    }

    #[test]
    fn modify_requires_content() {
        let mut event = base_event(EditKind::Modify);
        event.content = None;
        assert_eq!(event.validate().unwrap_err().code, "missing_field");
    }

    #[test]
    fn delete_rejects_content() {
        let event = base_event(EditKind::Delete);
        assert_eq!(event.validate().unwrap_err().code, "unexpected_field");
    }

    #[test]
    fn rename_requires_distinct_new_path() {
        let mut event = base_event(EditKind::Rename);
        event.content = None;
        assert!(event.validate().is_err());

        event.new_path = Some("src/lib.rs".to_string());
        assert!(event.validate().is_err());

        event.new_path = Some("src/main.rs".to_string());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_paths_escaping_the_project() {
        let mut event = base_event(EditKind::Modify);
        event.path = "../outside.rs".to_string();
        assert_eq!(event.validate().unwrap_err().code, "invalid_path");

        event.path = "/etc/passwd".to_string();
        assert_eq!(event.validate().unwrap_err().code, "invalid_path");
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut event = base_event(EditKind::Modify);
        event.recorded_at = "not-a-time".to_string();
        assert_eq!(event.validate().unwrap_err().code, "invalid_timestamp");
    }

    #[test]
    fn rejects_long_event_id() {
        let mut event = base_event(EditKind::Modify);
        event.event_id = "a".repeat(256);
        assert!(event.validate().is_err());
    }

    #[test]
    fn constructors_produce_valid_events() {
        assert!(EditEvent::create("a.txt", "x").validate().is_ok());
        assert!(EditEvent::modify("a.txt", "y").validate().is_ok());
        assert!(EditEvent::delete("a.txt").validate().is_ok());
        assert!(EditEvent::rename("a.txt", "b.txt").validate().is_ok());
    }

    #[test]
    fn parse_edit_line_skips_blank_lines() {
        assert!(parse_edit_line("   ").unwrap().is_none());
        let line = r#"{"event_id":"e1","recorded_at":"2026-01-30T12:00:00Z","kind":"delete","path":"old.rs"}"#;
        let event = parse_edit_line(line).unwrap().unwrap();
        assert_eq!(event.kind, EditKind::Delete);
        assert_eq!(event.path, "old.rs");
    }

    #[test]
    fn parse_edit_line_rejects_unknown_fields() {
        let line = r#"{"event_id":"e1","recorded_at":"2026-01-30T12:00:00Z","kind":"delete","path":"a","extra":1}"#;
        assert_eq!(parse_edit_line(line).unwrap_err().code, "invalid_params");
    }

    #[test]
    fn error_location_parses_path_and_line() {
        let location = ErrorLocation::parse("src/lib.rs:42").unwrap();
        assert_eq!(location.path, "src/lib.rs");
        assert_eq!(location.line, 42);

        let location = ErrorLocation::parse("src/lib.rs").unwrap();
        assert_eq!(location.line, 0);

        assert!(ErrorLocation::parse("src/lib.rs:abc").is_err());
    }

    #[test]
    fn fix_specs_require_changes_unless_unavailable() {
        let payload = r#"[
            {"label": "add import", "changes": [{"path": "a.rs", "content": "use x;"}]},
            {"label": "rename symbol", "unavailable": true}
        ]"#;
        let specs = parse_fix_specs(payload).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[1].unavailable);

        let payload = r#"[{"label": "empty"}]"#;
        assert!(parse_fix_specs(payload).is_err());
    }
}
