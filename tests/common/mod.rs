//! Shared fixtures for the integration tests: scripted runners, a recording
//! broadcaster and catalog seeding against the public API.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use agent_manager::adapters::{
    Broadcaster, ExecuteRequest, ExecuteResult, ExtractionRequest, MemoryLockManager,
    RecommendationExtractor, Runner, RunnerCapabilities, RunnerRegistry,
};
use agent_manager::domain::{
    AgentProfile, EventPayload, RecommendationCategory, RecommendationResult, Run, RunEvent,
    RunMode, RunPhase, RunSummary, RunnerKind, Task, TaskStatus,
};
use agent_manager::executor::{ExecutorConfig, ExecutorDeps};
use agent_manager::store::Repositories;
use agent_manager::{Orchestrator, OrchestratorConfig};

// ── Runner ────────────────────────────────────────────────────────────

/// Claude-kind runner that sleeps, then exits with a scripted code.
pub struct MockRunner {
    delay: Duration,
    exit_code: AtomicI32,
    pub calls: AtomicUsize,
    pub stops: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            exit_code: AtomicI32::new(0),
            calls: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Claude
    }

    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities {
            streams_events: true,
            supports_stop: true,
            supports_max_turns: true,
        }
    }

    async fn is_available(&self) -> (bool, String) {
        (true, "mock".to_string())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        request
            .events
            .emit(EventPayload::assistant(format!("working on {}", request.tag)));
        tokio::time::sleep(self.delay).await;
        Ok(ExecuteResult {
            exit_code: self.exit_code.load(Ordering::SeqCst),
            summary: Some(RunSummary {
                description: "tightened the retry loop".to_string(),
                turns: 3,
                tool_calls: 5,
                files_modified: vec!["src/lib.rs".to_string()],
            }),
            error: None,
        })
    }

    async fn stop(&self, _run_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Broadcaster ───────────────────────────────────────────────────────

/// Keeps every message it is handed.
#[derive(Default)]
pub struct RecordingBroadcaster {
    statuses: Mutex<Vec<Run>>,
    events: Mutex<Vec<RunEvent>>,
    progress: Mutex<Vec<(String, RunPhase, u8)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses_for(&self, run_id: &str) -> Vec<Run> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id == run_id)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn progress_for(&self, run_id: &str) -> Vec<(RunPhase, u8)> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == run_id)
            .map(|(_, phase, percent)| (*phase, *percent))
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast_event(&self, event: &RunEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn broadcast_run_status(&self, run: &Run) {
        self.statuses.lock().unwrap().push(run.clone());
    }

    fn broadcast_progress(&self, run_id: &str, phase: RunPhase, percent: u8, _action: &str) {
        self.progress
            .lock()
            .unwrap()
            .push((run_id.to_string(), phase, percent));
    }
}

// ── Extractor ─────────────────────────────────────────────────────────

/// Either always succeeds with one category or always fails with an
/// infrastructure error.
pub struct MockExtractor {
    succeed: bool,
    pub calls: AtomicUsize,
}

impl MockExtractor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecommendationExtractor for MockExtractor {
    async fn is_available(&self) -> bool {
        true
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<RecommendationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Err(anyhow!("model offline"));
        }
        Ok(RecommendationResult {
            success: true,
            categories: vec![RecommendationCategory {
                name: "prompt".to_string(),
                items: vec!["state the scope up front".to_string()],
            }],
            raw_text: request.text.clone(),
            extracted_from: request.source.clone(),
            error: None,
        })
    }
}

// ── Catalog ───────────────────────────────────────────────────────────

pub fn profile(name: &str) -> AgentProfile {
    let now = Utc::now();
    AgentProfile {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        runner_kind: RunnerKind::Claude,
        model: "sonnet".to_string(),
        max_turns: 20,
        requires_sandbox: false,
        created_at: now,
        updated_at: now,
    }
}

pub fn task(title: &str, project_root: &TempDir) -> Task {
    let now = Utc::now();
    Task {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        description: format!("{} in the worker loop", title),
        scope_path: ".".to_string(),
        project_root: project_root.path().to_string_lossy().into_owned(),
        status: TaskStatus::Queued,
        created_at: now,
        updated_at: now,
    }
}

/// Persist a profile and a task rooted at `project_root`.
pub async fn seed_catalog(
    repos: &Repositories,
    project_root: &TempDir,
) -> Result<(AgentProfile, Task)> {
    let profile = profile("default");
    let task = task("fix flaky test", project_root);
    repos.profiles.create_profile(&profile).await?;
    repos.tasks.create_task(&task).await?;
    Ok((profile, task))
}

/// Persist a run (with its own profile and task) after `shape` adjusts it.
pub async fn seed_run(
    repos: &Repositories,
    project_root: &TempDir,
    shape: impl FnOnce(&mut Run),
) -> Result<Run> {
    let (profile, task) = seed_catalog(repos, project_root).await?;
    let mut run = Run::new(&task.id, &profile.id, RunMode::InPlace);
    shape(&mut run);
    repos.runs.create_run(&run).await?;
    Ok(run)
}

// ── Orchestrator ──────────────────────────────────────────────────────

pub fn fast_executor() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_stop_grace(Duration::from_millis(200))
}

pub fn orchestrator_with(
    repos: Repositories,
    runner: Arc<MockRunner>,
    broadcaster: Arc<RecordingBroadcaster>,
    executor: ExecutorConfig,
) -> Orchestrator {
    let deps = ExecutorDeps {
        repos,
        runners: RunnerRegistry::new().with(runner),
        sandbox: None,
        locks: Some(Arc::new(MemoryLockManager::new())),
        broadcaster,
    };
    let config = OrchestratorConfig::default()
        .with_require_sandbox_by_default(false)
        .with_executor(executor);
    Orchestrator::new(config, deps)
}

pub fn orchestrator(repos: Repositories, runner: Arc<MockRunner>) -> Orchestrator {
    orchestrator_with(repos, runner, RecordingBroadcaster::new(), fast_executor())
}
