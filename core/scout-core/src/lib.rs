//! # scout-core
//!
//! Speculative fix evaluation for a monitored project. Edits to the project
//! are mirrored into a private shadow copy; when a fix is requested, every
//! candidate is applied to the frozen shadow, built, measured, and reverted,
//! and the candidates come back ranked by how many compiler errors remain.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Background work runs on named OS threads.
//! - **Thread-safe**: Public types are `Send + Sync`; state lives behind `Mutex` + `Condvar`.
//! - **Stale results are never delivered**: Any edit, newer request, or desync
//!   invalidates the current session, and an invalidated session returns no results.
//! - **Resilient workers**: A failing cycle is logged and the worker keeps running.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scout_core::{CommandBuild, MonitorRegistry, ScoutConfig, StaticProposals, StorageConfig};
//!
//! let build = Arc::new(CommandBuild::new("cargo check", DEFAULT_ERROR_PATTERN)?);
//! let registry = MonitorRegistry::new(StorageConfig::from_home()?, ScoutConfig::default(), build);
//! let handle = registry.start_monitoring(project, Arc::new(StaticProposals::new(candidates)))?;
//! let session = registry.request_evaluation(&handle, location)?;
//! let ranked = session.wait_until_activated();
//! ```

pub mod build;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod project;
pub mod proposal;
pub mod registry;
pub mod runner;
pub mod session;
pub mod shadow;
pub mod storage;
pub mod worker;

pub use build::{BuildService, CommandBuild, DEFAULT_ERROR_PATTERN};
pub use config::*;
pub use error::{Result, ScoutError};
pub use evaluator::{RoundOutcome, SpeculativeEvaluator};
pub use project::{resolve_project_identity, ProjectId, ProjectIdentity};
pub use proposal::{
    rank, ranked_entries, Applied, AugmentedProposal, CandidateProposal, ErrorCount,
    FileEditFix, FixAction, ProposalSource, RankedEntry, Revert, StaticProposals,
};
pub use registry::{MonitorHandle, MonitorRegistry};
pub use runner::MonitorRunner;
pub use session::{InvalidationReason, Session, SessionState};
pub use shadow::{
    DirectoryCloner, FingerprintDiff, ProjectCloner, ProjectFingerprint, ShadowSynchronizer,
    SyncOptions, SyncStats,
};
pub use storage::StorageConfig;
pub use worker::{BlockableWorker, Cycle, PeriodicWorker};
