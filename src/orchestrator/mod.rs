//! Orchestrator façade.
//!
//! Owns the dependency wiring and every public operation on profiles,
//! tasks, runs and investigations. Run execution is handed to a
//! [`RunExecutor`] per run, spawned on the runtime and tracked here so it
//! can be stopped, resumed or drained on shutdown.

mod catalog;
mod investigations;
mod review;

pub use investigations::{CreateInvestigationRequest, FIX_TAG_PREFIX, build_investigation_prompt};
pub use review::{HealthReport, HealthStatus, RunnerHealth};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{PolicyDecision, PolicyEvaluator, PolicyRequest};
use crate::domain::{
    AgentProfile, RecommendationState, RecommendationStatus, ResolvedConfig, Run, RunCheckpoint,
    RunEvent, RunMode, RunProgress, RunStatus, Task,
};
use crate::errors::OrchestratorError;
use crate::executor::{ExecutionOutcome, ExecutorConfig, ExecutorDeps, RunExecutor};
use crate::store::{EventQuery, RunFilter};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Run timeout used when the executor config leaves it at zero.
    pub default_timeout: Duration,
    pub max_concurrent_runs: usize,
    /// Project root for tasks created without one.
    pub default_project_root: Option<PathBuf>,
    /// Mode used when neither the caller nor policy picks one.
    pub require_sandbox_by_default: bool,
    pub idempotency_ttl: Duration,
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30 * 60),
            max_concurrent_runs: 4,
            default_project_root: None,
            require_sandbox_by_default: true,
            idempotency_ttl: Duration::from_secs(60 * 60),
            executor: ExecutorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    pub fn with_default_project_root(mut self, root: Option<PathBuf>) -> Self {
        self.default_project_root = root;
        self
    }

    pub fn with_require_sandbox_by_default(mut self, required: bool) -> Self {
        self.require_sandbox_by_default = required;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    fn executor_config(&self) -> ExecutorConfig {
        let mut config = self.executor.clone();
        if config.timeout.is_zero() {
            config.timeout = self.default_timeout;
        }
        config
    }
}

/// Inputs to [`Orchestrator::create_run`].
#[derive(Debug, Clone, Default)]
pub struct CreateRunRequest {
    pub task_id: String,
    pub profile_id: String,
    /// Replaces the task description as the runner prompt.
    pub prompt: Option<String>,
    pub mode: Option<RunMode>,
    pub force_in_place: bool,
    pub idempotency_key: Option<String>,
}

impl CreateRunRequest {
    pub fn new(task_id: &str, profile_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            profile_id: profile_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn in_place(mut self) -> Self {
        self.force_in_place = true;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Everything needed to persist and dispatch one admitted run.
struct Admission {
    task: Task,
    profile: AgentProfile,
    mode: RunMode,
    requires_review: bool,
}

struct LiveRun {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<ExecutionOutcome>,
}

type LiveRuns = Arc<Mutex<HashMap<String, LiveRun>>>;

pub struct Orchestrator {
    config: OrchestratorConfig,
    deps: ExecutorDeps,
    policy: Option<Arc<dyn PolicyEvaluator>>,
    permits: Arc<Semaphore>,
    live: LiveRuns,
    generation: AtomicU64,
    root: CancellationToken,
    /// Serializes approve/reject so one review decision wins.
    reviews: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, deps: ExecutorDeps) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            config,
            deps,
            policy: None,
            permits,
            live: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            root: CancellationToken::new(),
            reviews: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn deps(&self) -> &ExecutorDeps {
        &self.deps
    }

    /// Number of executors currently dispatched (running or waiting for a
    /// permit).
    pub fn active_runs(&self) -> usize {
        lock_live(&self.live)
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    pub fn has_live_executor(&self, run_id: &str) -> bool {
        lock_live(&self.live)
            .get(run_id)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Create and dispatch a run. With an idempotency key, a repeated call
    /// returns the run created by the first one once it has finished, and
    /// a conflict while it is still in flight.
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<Run> {
        let key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        if let Some(key) = &key {
            if let Some(existing) = self.replay_idempotent(key).await? {
                return Ok(existing);
            }
            let reserved = self
                .deps
                .repos
                .idempotency
                .reserve(key, self.config.idempotency_ttl)
                .await
                .map_err(OrchestratorError::Database)?;
            if !reserved {
                return Err(OrchestratorError::Conflict(format!(
                    "a request with idempotency key '{}' is already in progress",
                    key
                )));
            }
        }

        let created = self.admit_and_persist(&request, key.as_deref(), None).await;
        let run = match created {
            Ok(run) => run,
            Err(e) => {
                if let Some(key) = &key
                    && let Err(mark) = self.deps.repos.idempotency.fail(key).await
                {
                    tracing::warn!(key = %key, error = %format!("{:#}", mark), "Failed to release idempotency reservation");
                }
                return Err(e);
            }
        };

        if let Some(key) = &key
            && let Err(e) = self
                .deps
                .repos
                .idempotency
                .complete(key, &run.id, "run", None)
                .await
        {
            tracing::warn!(key = %key, run_id = %run.id, error = %format!("{:#}", e), "Failed to complete idempotency reservation");
        }

        self.dispatch(&run.id, None, request.prompt.clone());
        Ok(run)
    }

    /// The run an earlier call with `key` produced, if any.
    async fn replay_idempotent(&self, key: &str) -> Result<Option<Run>> {
        let repos = &self.deps.repos;
        let record = repos
            .idempotency
            .check(key)
            .await
            .map_err(OrchestratorError::Database)?;

        let bound = match record {
            Some(record) => match record.status {
                crate::domain::IdempotencyStatus::Pending => {
                    return Err(OrchestratorError::Conflict(format!(
                        "a request with idempotency key '{}' is already in progress",
                        key
                    )));
                }
                crate::domain::IdempotencyStatus::Complete => match record.entity_id {
                    Some(id) => repos
                        .runs
                        .get_run(&id)
                        .await
                        .map_err(OrchestratorError::Database)?,
                    None => None,
                },
                crate::domain::IdempotencyStatus::Failed => None,
            },
            None => None,
        };
        // An expired reservation still leaves its run behind.
        let bound = match bound {
            Some(run) => Some(run),
            None => repos
                .runs
                .find_by_idempotency_key(key)
                .await
                .map_err(OrchestratorError::Database)?,
        };

        match bound {
            Some(run) if !run.status.is_terminal() => Err(OrchestratorError::Conflict(format!(
                "run {} for idempotency key '{}' is still {}",
                run.id, key, run.status
            ))),
            Some(run) => {
                tracing::debug!(run_id = %run.id, key, "Returning run for repeated idempotency key");
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Validate, consult policy, check the runner and persist a pending run.
    async fn admit_and_persist(
        &self,
        request: &CreateRunRequest,
        key: Option<&str>,
        tag: Option<String>,
    ) -> Result<Run> {
        let admission = self.admit(request).await?;

        let mut run = Run::new(&admission.task.id, &admission.profile.id, admission.mode);
        run.idempotency_key = key.map(str::to_string);
        run.tag = tag;
        run.resolved_config = Some(ResolvedConfig {
            runner_kind: admission.profile.runner_kind,
            model: admission.profile.model.clone(),
            max_turns: admission.profile.max_turns,
            requires_review: admission.requires_review,
        });
        self.deps
            .repos
            .runs
            .create_run(&run)
            .await
            .map_err(OrchestratorError::Database)?;

        tracing::info!(
            run_id = %run.id,
            task_id = %run.task_id,
            profile_id = %run.profile_id,
            mode = run.mode.as_str(),
            tag = run.effective_tag(),
            "Run created"
        );
        self.deps.broadcaster.broadcast_run_status(&run);
        Ok(run)
    }

    async fn admit(&self, request: &CreateRunRequest) -> Result<Admission> {
        let repos = &self.deps.repos;
        let task = repos
            .tasks
            .get_task(&request.task_id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("task", &request.task_id))?;
        let profile = repos
            .profiles
            .get_profile(&request.profile_id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("profile", &request.profile_id))?;

        let requested_mode = if request.force_in_place {
            Some(RunMode::InPlace)
        } else {
            request.mode
        };
        let decision = match &self.policy {
            Some(policy) => {
                let policy_request = PolicyRequest {
                    task: task.clone(),
                    profile: profile.clone(),
                    requested_mode,
                };
                policy.evaluate(&policy_request).await.map_err(|e| {
                    OrchestratorError::Configuration(format!("policy evaluation failed: {:#}", e))
                })?
            }
            None => PolicyDecision::allow(None, false),
        };
        if !decision.allowed {
            tracing::warn!(
                task_id = %task.id,
                policy_id = %decision.policy_id,
                rule = %decision.rule,
                "Run denied by policy"
            );
            return Err(OrchestratorError::PolicyViolation {
                policy_id: decision.policy_id,
                policy_name: decision.policy_name,
                rule: decision.rule,
                reason: decision.reason,
            });
        }

        let mode = requested_mode
            .or(decision.recommended_mode)
            .unwrap_or(if self.config.require_sandbox_by_default || profile.requires_sandbox {
                RunMode::Sandboxed
            } else {
                RunMode::InPlace
            });

        let runner = self.deps.runners.get(profile.runner_kind).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "no runner registered for kind {}",
                profile.runner_kind
            ))
        })?;
        let (available, message) = runner.is_available().await;
        if !available {
            return Err(OrchestratorError::Configuration(format!(
                "runner {} unavailable: {}",
                profile.runner_kind, message
            )));
        }
        if mode == RunMode::Sandboxed && self.deps.sandbox.is_none() {
            return Err(OrchestratorError::Configuration(
                "sandboxed mode requested but no sandbox provider is configured".to_string(),
            ));
        }

        Ok(Admission {
            task,
            profile,
            mode,
            requires_review: decision.requires_review && mode == RunMode::Sandboxed,
        })
    }

    /// Spawn an executor for `run_id`. It waits for a concurrency permit,
    /// staying in phase queued, and removes itself from the live table when
    /// done.
    fn dispatch(&self, run_id: &str, resume: Option<RunCheckpoint>, prompt: Option<String>) {
        let mut executor = RunExecutor::new(run_id, self.config.executor_config(), self.deps.clone())
            .with_prompt(prompt);
        if let Some(checkpoint) = resume {
            executor = executor.with_resume(checkpoint);
        }

        let cancel = self.root.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let permits = self.permits.clone();
        let live = self.live.clone();
        let token = cancel.clone();
        let id = run_id.to_string();

        let mut table = lock_live(&self.live);
        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = token.cancelled() => None,
            };
            let outcome = executor.execute(token).await;
            let mut table = lock_live(&live);
            if table.get(&id).is_some_and(|entry| entry.generation == generation) {
                table.remove(&id);
            }
            outcome
        });
        table.insert(
            run_id.to_string(),
            LiveRun {
                generation,
                cancel,
                handle,
            },
        );
        tracing::debug!(run_id, "Run dispatched");
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.deps
            .repos
            .runs
            .get_run(run_id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("run", run_id))
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        self.deps
            .repos
            .runs
            .list_runs(filter)
            .await
            .map_err(OrchestratorError::Database)
    }

    /// Delete a finished run with its events and checkpoint.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if !run.status.is_terminal() || self.has_live_executor(run_id) {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is {} and cannot be deleted",
                run_id, run.status
            )));
        }
        self.deps
            .repos
            .runs
            .delete_run(run_id)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    /// Stop a starting or running run. A run executing in this process is
    /// cancelled through its executor; otherwise the runner is asked
    /// directly. Pending runs have not reached a runner and are refused.
    pub async fn stop_run(&self, run_id: &str) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if !matches!(run.status, RunStatus::Starting | RunStatus::Running) {
            return Err(OrchestratorError::InvalidState(format!(
                "cannot stop run {} in status {}",
                run_id, run.status
            )));
        }

        let entry = lock_live(&self.live)
            .get(run_id)
            .map(|entry| entry.cancel.clone());
        if let Some(cancel) = entry {
            tracing::info!(run_id, "Cancelling run executor");
            cancel.cancel();
            self.await_executor(run_id).await;
            return self.get_run(run_id).await;
        }

        let profile = self
            .deps
            .repos
            .profiles
            .get_profile(&run.profile_id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("profile", &run.profile_id))?;
        let runner = self.deps.runners.get(profile.runner_kind).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "no runner registered for kind {}",
                profile.runner_kind
            ))
        })?;
        runner
            .stop(run_id)
            .await
            .map_err(|e| OrchestratorError::Runner(format!("{:#}", e)))?;

        let moved = self
            .deps
            .repos
            .runs
            .transition_status(
                run_id,
                &[RunStatus::Starting, RunStatus::Running],
                RunStatus::Cancelled,
                Some("stopped by request".to_string()),
            )
            .await
            .map_err(OrchestratorError::Database)?;
        let updated = self.get_run(run_id).await?;
        if moved {
            tracing::info!(run_id, "Run stopped");
            self.deps.broadcaster.broadcast_run_status(&updated);
        }
        Ok(updated)
    }

    /// Wait for a cancelled executor to write its final state.
    async fn await_executor(&self, run_id: &str) {
        let handle = lock_live(&self.live).remove(run_id).map(|entry| entry.handle);
        let Some(handle) = handle else {
            return;
        };
        let wait = self.config.executor.stop_grace * 2 + Duration::from_secs(5);
        match tokio::time::timeout(wait, handle).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(run_id, status = outcome.status.as_str(), "Executor finished")
            }
            Ok(Err(e)) => tracing::warn!(run_id, error = %e, "Executor task panicked"),
            Err(_) => tracing::warn!(run_id, "Executor did not finish within stop window"),
        }
    }

    /// Resume a failed or stalled run from its latest checkpoint.
    pub async fn resume_run(&self, run_id: &str) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if self.has_live_executor(run_id) {
            return Err(OrchestratorError::Conflict(format!(
                "run {} still has a live executor",
                run_id
            )));
        }
        let checkpoint = self
            .deps
            .repos
            .checkpoints
            .get_checkpoint(run_id)
            .await
            .map_err(OrchestratorError::Database)?;
        if !run.is_resumable(
            checkpoint.as_ref(),
            self.config.executor.stale_threshold,
            Utc::now(),
        ) {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} in status {} is not resumable",
                run_id, run.status
            )));
        }

        let checkpoint = checkpoint.unwrap_or_else(|| RunCheckpoint::queued(run_id));
        let reopened = self
            .deps
            .repos
            .runs
            .reopen_for_resume(run_id, checkpoint.phase)
            .await
            .map_err(OrchestratorError::Database)?;
        if !reopened {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} changed state before it could be resumed",
                run_id
            )));
        }
        tracing::info!(run_id, phase = checkpoint.phase.as_str(), "Resuming run");

        self.dispatch(run_id, Some(checkpoint), None);
        let updated = self.get_run(run_id).await?;
        self.deps.broadcaster.broadcast_run_status(&updated);
        Ok(updated)
    }

    pub async fn get_run_progress(&self, run_id: &str) -> Result<RunProgress> {
        let run = self.get_run(run_id).await?;
        Ok(RunProgress::from_run(&run, Utc::now()))
    }

    /// Running runs whose heartbeat is older than `threshold` (the executor
    /// stale threshold when `None`).
    pub async fn list_stale_runs(&self, threshold: Option<Duration>) -> Result<Vec<Run>> {
        let threshold = threshold.unwrap_or(self.config.executor.stale_threshold);
        let now = Utc::now();
        let runs = self
            .deps
            .repos
            .runs
            .list_by_status(&[RunStatus::Running])
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(runs
            .into_iter()
            .filter(|run| run.is_stale(threshold, now))
            .collect())
    }

    pub async fn get_run_events(&self, run_id: &str, query: &EventQuery) -> Result<Vec<RunEvent>> {
        self.get_run(run_id).await?;
        self.deps
            .repos
            .events
            .get_events(run_id, query)
            .await
            .map_err(OrchestratorError::Database)
    }

    /// Stored events after `query.after_sequence`, then live appends.
    pub async fn stream_run_events(
        &self,
        run_id: &str,
        query: EventQuery,
    ) -> Result<BoxStream<'static, RunEvent>> {
        self.get_run(run_id).await?;
        self.deps
            .repos
            .events
            .stream(run_id, query)
            .await
            .map_err(OrchestratorError::Database)
    }

    /// Put a finished extraction back in the queue with a clean slate.
    pub async fn regenerate_recommendations(&self, run_id: &str) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if !matches!(
            run.recommendation.status,
            RecommendationStatus::Failed | RecommendationStatus::Complete
        ) {
            return Err(OrchestratorError::InvalidState(format!(
                "recommendations for run {} are {}",
                run_id,
                run.recommendation.status.as_str()
            )));
        }
        let state = RecommendationState {
            status: RecommendationStatus::Pending,
            attempts: 0,
            queued_at: Some(Utc::now()),
            result: None,
            error: None,
        };
        self.deps
            .repos
            .runs
            .update_recommendation(run_id, &state)
            .await
            .map_err(OrchestratorError::Database)?;
        let updated = self.get_run(run_id).await?;
        self.deps.broadcaster.broadcast_run_status(&updated);
        Ok(updated)
    }

    /// Cancel every live executor and wait for them to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.permits.close();
        let entries: Vec<(String, LiveRun)> = lock_live(&self.live).drain().collect();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Waiting for run executors to stop");
        }
        for (run_id, entry) in entries {
            match entry.handle.await {
                Ok(outcome) => {
                    tracing::debug!(run_id = %run_id, status = outcome.status.as_str(), "Executor drained")
                }
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Executor task panicked"),
            }
        }
    }

    /// Wait until `run_id` is terminal and its executor has exited, or
    /// `timeout` passes. Returns the last observed run.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id).await?;
            let settled = run.status.is_terminal() && !self.has_live_executor(run_id);
            if settled || tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn lock_live(live: &LiveRuns) -> std::sync::MutexGuard<'_, HashMap<String, LiveRun>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::adapters::{
        ExecuteRequest, ExecuteResult, MemoryLockManager, NullBroadcaster, Runner,
        RunnerCapabilities, RunnerRegistry,
    };
    use crate::domain::{EventPayload, RunSummary, RunnerKind};
    use crate::store::Repositories;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    pub struct SleepRunner {
        pub delay: Duration,
        pub exit_code: i32,
        pub available: bool,
        pub calls: AtomicUsize,
    }

    impl SleepRunner {
        pub fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                exit_code: 0,
                available: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Runner for SleepRunner {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Claude
        }

        fn capabilities(&self) -> RunnerCapabilities {
            RunnerCapabilities {
                streams_events: true,
                supports_stop: true,
                supports_max_turns: false,
            }
        }

        async fn is_available(&self) -> (bool, String) {
            (self.available, "sleep runner".into())
        }

        async fn execute(&self, request: ExecuteRequest) -> anyhow::Result<ExecuteResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            request.events.emit(EventPayload::assistant("working"));
            tokio::time::sleep(self.delay).await;
            Ok(ExecuteResult {
                exit_code: self.exit_code,
                summary: Some(RunSummary {
                    description: format!("finished: {}", request.prompt),
                    ..Default::default()
                }),
                error: None,
            })
        }

        async fn stop(&self, _run_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub fn orchestrator(runner: Arc<SleepRunner>) -> anyhow::Result<Orchestrator> {
        let deps = ExecutorDeps {
            repos: Repositories::in_memory()?,
            runners: RunnerRegistry::new().with(runner),
            sandbox: None,
            locks: Some(Arc::new(MemoryLockManager::new())),
            broadcaster: Arc::new(NullBroadcaster),
        };
        let config = OrchestratorConfig::default()
            .with_require_sandbox_by_default(false)
            .with_executor(
                ExecutorConfig::default()
                    .with_heartbeat_interval(Duration::from_millis(20))
                    .with_stop_grace(Duration::from_millis(100)),
            );
        Ok(Orchestrator::new(config, deps))
    }
}
