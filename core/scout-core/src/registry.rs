//! Registry of monitored projects, keyed by project identity.
//!
//! With `registry.exclusive = true` (the default) starting a new project
//! hands off: every other monitor is stopped first, so at most one shadow
//! exists at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scout_protocol::{EditEvent, ErrorLocation};
use serde::Serialize;
use tracing::{debug, info};

use crate::build::BuildService;
use crate::config::ScoutConfig;
use crate::error::{Result, ScoutError};
use crate::project::{resolve_project_identity, ProjectId};
use crate::proposal::{AugmentedProposal, ProposalSource};
use crate::runner::MonitorRunner;
use crate::session::Session;
use crate::shadow::{DirectoryCloner, ProjectCloner};
use crate::storage::StorageConfig;

/// Caller-facing reference to a monitored project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MonitorHandle {
    pub id: ProjectId,
    pub name: String,
    pub root: PathBuf,
}

pub struct MonitorRegistry {
    storage: StorageConfig,
    config: ScoutConfig,
    cloner: Arc<dyn ProjectCloner>,
    build: Arc<dyn BuildService>,
    runners: Mutex<HashMap<ProjectId, Arc<MonitorRunner>>>,
}

impl MonitorRegistry {
    pub fn new(storage: StorageConfig, config: ScoutConfig, build: Arc<dyn BuildService>) -> Self {
        let cloner = Arc::new(DirectoryCloner::new(config.fingerprint.ignore.clone()));
        Self {
            storage,
            config,
            cloner,
            build,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cloner(mut self, cloner: Arc<dyn ProjectCloner>) -> Self {
        self.cloner = cloner;
        self
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<ProjectId, Arc<MonitorRunner>>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_for(runner: &MonitorRunner) -> MonitorHandle {
        let identity = runner.identity();
        MonitorHandle {
            id: identity.id.clone(),
            name: identity.name.clone(),
            root: identity.root.clone(),
        }
    }

    /// Starts monitoring `project`. Monitoring an already-monitored project
    /// returns its existing handle.
    pub fn start_monitoring(
        &self,
        project: &Path,
        proposals: Arc<dyn ProposalSource>,
    ) -> Result<MonitorHandle> {
        let identity = resolve_project_identity(project)?;
        if let Some(runner) = self.runners().get(&identity.id) {
            debug!(project = %identity.name, "Project already monitored");
            return Ok(Self::handle_for(runner));
        }

        if self.config.registry.exclusive {
            let displaced: Vec<Arc<MonitorRunner>> = {
                let mut runners = self.runners();
                let ids: Vec<ProjectId> = runners
                    .keys()
                    .filter(|id| **id != identity.id)
                    .cloned()
                    .collect();
                ids.iter().filter_map(|id| runners.remove(id)).collect()
            };
            for runner in displaced {
                info!(
                    from = %runner.identity().name,
                    to = %identity.name,
                    "Handing off monitoring"
                );
                runner.stop();
            }
        }

        let runner = Arc::new(MonitorRunner::start(
            identity,
            &self.storage,
            &self.config,
            Arc::clone(&self.cloner),
            Arc::clone(&self.build),
            proposals,
        )?);
        let handle = Self::handle_for(&runner);

        let mut runners = self.runners();
        if let Some(existing) = runners.get(&handle.id) {
            // Lost a race with a concurrent start of the same project.
            let existing = Self::handle_for(existing);
            drop(runners);
            runner.stop();
            return Ok(existing);
        }
        runners.insert(handle.id.clone(), runner);
        Ok(handle)
    }

    pub fn runner(&self, handle: &MonitorHandle) -> Result<Arc<MonitorRunner>> {
        self.runners()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| ScoutError::ProjectNotMonitored(handle.name.clone()))
    }

    pub fn is_monitored(&self, handle: &MonitorHandle) -> bool {
        self.runners().contains_key(&handle.id)
    }

    pub fn monitored(&self) -> Vec<MonitorHandle> {
        let mut handles: Vec<MonitorHandle> = self
            .runners()
            .values()
            .map(|runner| Self::handle_for(runner))
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn notify_edit(&self, handle: &MonitorHandle, event: EditEvent) -> Result<u64> {
        self.runner(handle)?.notify_edit(event)
    }

    pub fn request_evaluation(
        &self,
        handle: &MonitorHandle,
        location: ErrorLocation,
    ) -> Result<Arc<Session>> {
        self.runner(handle)?.request_evaluation(location)
    }

    /// The ranked list for `session`, or `None` unless it is active.
    pub fn ranked_results(&self, session: &Session) -> Option<Vec<AugmentedProposal>> {
        session.results()
    }

    pub fn stop_monitoring(&self, handle: &MonitorHandle) -> Result<()> {
        let runner = self
            .runners()
            .remove(&handle.id)
            .ok_or_else(|| ScoutError::ProjectNotMonitored(handle.name.clone()))?;
        runner.stop();
        Ok(())
    }

    pub fn stop_all(&self) {
        let runners: Vec<_> = self.runners().drain().map(|(_, runner)| runner).collect();
        for runner in runners {
            runner.stop();
        }
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
