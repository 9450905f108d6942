//! `scout fingerprint`: print a project's content fingerprint, or compare two trees.

use std::path::Path;

use scout_core::{ProjectFingerprint, Result, ScoutError};
use serde_json::{json, Value};

/// Returns false when `against` is given and the trees differ.
pub fn run(project: &Path, against: Option<&Path>, ignore: &[String]) -> Result<bool> {
    let reference = ProjectFingerprint::compute(project, ignore)?;
    let (output, identical) = match against {
        None => (
            json!({ "files": reference.len(), "fingerprint": reference }),
            true,
        ),
        Some(other) => {
            let diff = reference.diff(&ProjectFingerprint::compute(other, ignore)?);
            let identical = diff.is_empty();
            (json!({ "identical": identical, "diff": diff }), identical)
        }
    };
    println!("{}", render(&output)?);
    Ok(identical)
}

fn render(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|err| ScoutError::Json {
        context: "Failed to serialize fingerprint".to_string(),
        source: err,
    })
}
