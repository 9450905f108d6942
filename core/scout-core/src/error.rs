//! Error types for scout-core operations.

use std::path::PathBuf;

use scout_protocol::ErrorInfo;

/// All errors that can occur in scout-core operations.
///
/// Failures that the engine absorbs locally (a single worker cycle failing,
/// a candidate that cannot be measured) never surface as `ScoutError`; they are
/// logged or recorded as sentinels instead.
#[derive(Debug, thiserror::Error)]
pub enum ScoutError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Shadow Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid edit event: {0}")]
    InvalidEvent(ErrorInfo),

    #[error("Failed to clone {original} into {destination}: {details}")]
    CloneFailed {
        original: PathBuf,
        destination: PathBuf,
        details: String,
    },

    #[error("Failed to apply {kind} event for {path}: {details}")]
    ApplyFailed {
        kind: String,
        path: String,
        details: String,
    },

    #[error("Path escapes the shadow project: {0}")]
    PathOutsideShadow(String),

    #[error("Failed to fingerprint {path}: {details}")]
    Fingerprint { path: PathBuf, details: String },

    #[error("Worker {name} could not be started: {details}")]
    WorkerStart { name: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Evaluation Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid request: {0}")]
    InvalidRequest(ErrorInfo),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Build timed out after {secs}s")]
    BuildTimedOut { secs: u64 },

    #[error("Failed to apply fix '{label}': {details}")]
    FixFailed { label: String, details: String },

    #[error("Failed to revert fix '{label}': {details}")]
    RevertFailed { label: String, details: String },

    #[error("Shadow project diverged from the original: {0}")]
    Desync(String),

    // ─────────────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Project not monitored: {0}")]
    ProjectNotMonitored(String),

    #[error("Invalid project path: {path}: {reason}")]
    InvalidProjectPath { path: String, reason: String },
}

impl ScoutError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ScoutError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<ErrorInfo> for ScoutError {
    fn from(info: ErrorInfo) -> Self {
        ScoutError::InvalidEvent(info)
    }
}

/// Convenience type alias for Results using ScoutError.
pub type Result<T> = std::result::Result<T, ScoutError>;
