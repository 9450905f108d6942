//! `scout evaluate`: rank candidate fixes for one error location.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scout_core::{
    ranked_entries, CommandBuild, MonitorRegistry, RankedEntry, Result, ScoutConfig, ScoutError,
    StaticProposals, StorageConfig,
};
use scout_protocol::{parse_fix_specs, ErrorLocation};
use serde_json::json;
use tracing::{info, warn};

pub struct EvaluateArgs {
    pub project: PathBuf,
    pub location: String,
    pub fixes: PathBuf,
    pub build: String,
    pub error_pattern: String,
    pub timeout_secs: Option<u64>,
    pub json: bool,
}

/// Returns false when the round was invalidated instead of delivered.
pub fn run(args: EvaluateArgs, storage: StorageConfig, config: ScoutConfig) -> Result<bool> {
    let location = ErrorLocation::parse(&args.location).map_err(ScoutError::InvalidRequest)?;
    let specs = load_specs(&args.fixes)?;
    let timeout = args
        .timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .or_else(|| config.evaluation.build_timeout());
    let build = CommandBuild::new(&args.build, &args.error_pattern)?.with_timeout(timeout);

    let registry = MonitorRegistry::new(storage, config, Arc::new(build));
    let proposals = Arc::new(StaticProposals::from_specs(&specs, &location));
    let handle = registry.start_monitoring(&args.project, proposals)?;
    info!(project = %handle.name, location = %location, candidates = specs.len(), "Evaluating");

    let session = registry.request_evaluation(&handle, location)?;
    let delivered = match session.wait_until_activated() {
        Some(ranked) => {
            let entries = ranked_entries(&ranked);
            if args.json {
                println!("{}", to_json(&json!({ "ranked": entries }))?);
            } else {
                print!("{}", render_table(&entries));
            }
            true
        }
        None => {
            let reason = session.invalidation_reason();
            warn!(reason = ?reason, "Round was invalidated");
            if args.json {
                println!("{}", to_json(&json!({ "invalidated": reason }))?);
            }
            false
        }
    };

    registry.stop_all();
    Ok(delivered)
}

fn load_specs(path: &Path) -> Result<Vec<scout_protocol::FixSpec>> {
    let payload = fs_err::read_to_string(path)
        .map_err(|err| ScoutError::io("Failed to read candidate list", err))?;
    parse_fix_specs(&payload).map_err(ScoutError::InvalidRequest)
}

fn to_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|err| ScoutError::Json {
        context: "Failed to serialize ranking".to_string(),
        source: err,
    })
}

pub fn render_table(entries: &[RankedEntry]) -> String {
    let label_width = entries
        .iter()
        .map(|entry| entry.label.len())
        .max()
        .unwrap_or(0)
        .max("label".len());
    let mut out = format!(
        "{:<4}  {:<6}  {:<6}  {:>8}  {:<width$}\n",
        "rank",
        "before",
        "after",
        "elapsed",
        "label",
        width = label_width
    );
    for entry in entries {
        out.push_str(&format!(
            "{:<4}  {:<6}  {:<6}  {:>6}ms  {:<width$}\n",
            entry.rank,
            entry.errors_before,
            entry.errors_after.to_string(),
            entry.elapsed_ms,
            entry.label,
            width = label_width
        ));
    }
    out
}
