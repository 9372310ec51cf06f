//! Service wiring shared by every command that touches the store.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

use agent_manager::adapters::{
    ChannelBroadcaster, CliRunner, MemoryLockManager, OllamaExtractor, SandboxProvider,
    ScopePolicy, WorktreeSandbox,
};
use agent_manager::adapters::RunnerRegistry;
use agent_manager::config::Settings;
use agent_manager::executor::ExecutorDeps;
use agent_manager::logging::init_logging;
use agent_manager::orchestrator::Orchestrator;
use agent_manager::process::SystemProbe;
use agent_manager::reconciler::Reconciler;
use agent_manager::recommendations::RecommendationWorker;
use agent_manager::store::{Repositories, SqliteStore};
use agent_manager::terminator::Terminator;

use crate::Cli;

pub struct AppContext {
    pub settings: Settings,
    pub json: bool,
    pub repos: Repositories,
    pub runners: RunnerRegistry,
    pub sandbox: Option<Arc<dyn SandboxProvider>>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    _log_guard: Option<WorkerGuard>,
}

impl AppContext {
    pub fn open(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let mut settings = Settings::load(project_dir, cli.config.as_deref())?;
        if cli.verbose {
            settings.file.logging.level = "debug".to_string();
        }
        let log_guard = init_logging(&settings.file.logging, &settings.log_dir())?;

        let db_path = settings.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::open(&db_path)?;
        tracing::debug!(db = %db_path.display(), "Store opened");

        let mut runners = RunnerRegistry::new();
        for config in settings.file.runner_configs() {
            runners.register(Arc::new(CliRunner::new(config)));
        }
        let sandbox: Option<Arc<dyn SandboxProvider>> = if settings.file.sandbox.enabled {
            Some(Arc::new(WorktreeSandbox::new(settings.sandbox_config())))
        } else {
            None
        };

        Ok(Self {
            settings,
            json: cli.json,
            repos: Repositories::sqlite(store),
            runners,
            sandbox,
            broadcaster: Arc::new(ChannelBroadcaster::default()),
            _log_guard: log_guard,
        })
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let deps = ExecutorDeps {
            repos: self.repos.clone(),
            runners: self.runners.clone(),
            sandbox: self.sandbox.clone(),
            locks: Some(Arc::new(MemoryLockManager::new())),
            broadcaster: self.broadcaster.clone(),
        };
        Orchestrator::new(self.settings.orchestrator_config(), deps)
            .with_policy(Arc::new(ScopePolicy::default()))
    }

    pub fn terminator(&self) -> Arc<Terminator> {
        Arc::new(
            Terminator::new(
                self.settings.file.terminator_config(),
                Arc::new(SystemProbe::new()),
                self.runners.clone(),
            )
            .with_runs(self.repos.runs.clone())
            .with_broadcaster(self.broadcaster.clone()),
        )
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(
            Reconciler::new(
                self.settings.file.reconciler_config(),
                self.repos.runs.clone(),
                Arc::new(SystemProbe::new()),
            )
            .with_terminator(self.terminator())
            .with_broadcaster(self.broadcaster.clone()),
        )
    }

    pub fn worker(&self) -> Result<Arc<RecommendationWorker>> {
        let mut worker = RecommendationWorker::new(
            self.settings.file.worker_config(),
            self.repos.runs.clone(),
            self.repos.events.clone(),
        )
        .with_broadcaster(self.broadcaster.clone());
        if let Some(config) = self.settings.file.extractor_config() {
            worker = worker.with_extractor(Arc::new(OllamaExtractor::new(config)?));
        }
        Ok(Arc::new(worker))
    }
}
