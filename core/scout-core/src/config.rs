//! Runtime configuration (`{root}/config.toml`).
//!
//! Every field has a default, so a missing file or a partial file is fine.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ScoutError};

const DEFAULT_SYNC_INTERVAL_MS: u64 = 50;
const DEFAULT_MAX_SNAPSHOTS: usize = 20;

/// What the mirroring worker does when a single edit event cannot be applied.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyFailurePolicy {
    /// Log and drop the event, keep draining. Drift is only caught by
    /// fingerprint comparison.
    #[default]
    Drop,
    /// Log, discard the rest of the batch and re-clone the shadow.
    Resync,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub on_apply_failure: ApplyFailurePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            on_apply_failure: ApplyFailurePolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// 0 leaves builds unbounded.
    #[serde(default)]
    pub build_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_sync_before_delivery: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: 0,
            verify_sync_before_delivery: true,
        }
    }
}

impl EvaluationConfig {
    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout_secs > 0).then(|| Duration::from_secs(self.build_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    /// File or directory names skipped when cloning and fingerprinting.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            ignore: default_ignore(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub on_desync: bool,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            on_desync: true,
            max_snapshots: default_max_snapshots(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_true")]
    pub exclusive: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { exclusive: true }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScoutConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Loads the config at `path`, returning defaults when the file is missing.
pub fn load_config(path: Option<PathBuf>) -> Result<ScoutConfig> {
    let config_path = match path {
        Some(path) => path,
        None => crate::storage::StorageConfig::from_home()?.config_path(),
    };

    if !config_path.exists() {
        return Ok(ScoutConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| ScoutError::io("Failed to read scout config", err))?;
    toml::from_str::<ScoutConfig>(&content).map_err(|err| ScoutError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}

fn default_sync_interval_ms() -> u64 {
    DEFAULT_SYNC_INTERVAL_MS
}

fn default_max_snapshots() -> usize {
    DEFAULT_MAX_SNAPSHOTS
}

fn default_true() -> bool {
    true
}

fn default_ignore() -> Vec<String> {
    vec![
        ".git".to_string(),
        "target".to_string(),
        "node_modules".to_string(),
    ]
}
