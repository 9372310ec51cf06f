//! Run Executor: drives one run through its phases.
//!
//! ```text
//! initializing → sandbox_creating → runner_acquiring → executing
//!     → collecting_results → (awaiting_review | terminal)
//! ```
//!
//! The executor never returns an error to its caller. Every failure is
//! classified into a [`FailureKind`] and becomes a run status write plus a
//! terminal event. Heartbeats and periodic checkpoints run as subtasks so
//! they keep going while the runner call blocks.

mod checkpoint;
mod heartbeat;

pub use checkpoint::CheckpointTracker;
pub use heartbeat::Heartbeat;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    Broadcaster, EventSink, ExecuteRequest, ExecuteResult, LockManager, Runner, RunnerRegistry,
    SandboxProvider, SandboxRequest, StoreEventSink,
};
use crate::domain::{
    AgentProfile, ApprovalState, EventPayload, INVESTIGATION_TAG_PREFIX, RecommendationStatus,
    ResolvedConfig, Run, RunCheckpoint, RunMode, RunPhase, RunStatus, Task, TaskStatus,
};
use crate::errors::{FailureKind, PhaseError};
use crate::store::Repositories;

/// Phases the executor drives itself, in order.
const PHASES: [RunPhase; 5] = [
    RunPhase::Initializing,
    RunPhase::SandboxCreating,
    RunPhase::RunnerAcquiring,
    RunPhase::Executing,
    RunPhase::CollectingResults,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Wall-clock budget for the whole run.
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub checkpoint_interval: Duration,
    /// Retries per phase for transient failures.
    pub max_retries: u32,
    pub stale_threshold: Duration,
    /// How long to wait for the runner after asking it to stop.
    pub stop_grace: Duration,
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(60),
            max_retries: 3,
            stale_threshold: Duration::from_secs(120),
            stop_grace: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl ExecutorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Collaborators shared by every executor.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub repos: Repositories,
    pub runners: RunnerRegistry,
    pub sandbox: Option<Arc<dyn SandboxProvider>>,
    pub locks: Option<Arc<dyn LockManager>>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Final state reported by [`RunExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub error: Option<PhaseError>,
}

/// How collecting_results ended.
enum Completion {
    Complete,
    AwaitingReview,
}

/// Cancellation and deadline shared by every phase of one run.
struct Scope {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl Scope {
    fn timeout_error(&self) -> PhaseError {
        PhaseError::timeout(format!(
            "run exceeded its timeout of {}s",
            self.timeout.as_secs()
        ))
    }

    /// Between-phase check. Cancellation wins over an expired deadline.
    fn check(&self) -> Result<(), PhaseError> {
        if self.cancel.is_cancelled() {
            return Err(PhaseError::cancelled("run cancelled"));
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, PhaseError>>,
    ) -> Result<T, PhaseError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PhaseError::cancelled("run cancelled")),
            _ = tokio::time::sleep_until(self.deadline) => Err(self.timeout_error()),
            result = fut => result,
        }
    }
}

/// Owns exactly one run from dispatch to a terminal write.
pub struct RunExecutor {
    run_id: String,
    config: ExecutorConfig,
    deps: ExecutorDeps,
    resume_from: Option<RunCheckpoint>,
    prompt: Option<String>,
}

/// Mutable state of one execution.
struct Execution {
    run: Run,
    task: Task,
    profile: AgentProfile,
    checkpoint: CheckpointTracker,
    sink: Arc<StoreEventSink>,
    runner: Option<Arc<dyn Runner>>,
    result: Option<ExecuteResult>,
    lock_id: Option<String>,
}

impl RunExecutor {
    pub fn new(run_id: &str, config: ExecutorConfig, deps: ExecutorDeps) -> Self {
        Self {
            run_id: run_id.to_string(),
            config,
            deps,
            resume_from: None,
            prompt: None,
        }
    }

    /// Continue from `checkpoint` instead of starting fresh.
    pub fn with_resume(mut self, checkpoint: RunCheckpoint) -> Self {
        self.resume_from = Some(checkpoint);
        self
    }

    /// Replace the task description as the runner prompt.
    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Drive the run to a terminal write. Cancelling `cancel` stops the run
    /// and records it as cancelled.
    pub async fn execute(self, cancel: CancellationToken) -> ExecutionOutcome {
        let scope = Scope {
            cancel,
            deadline: Instant::now() + self.config.timeout,
            timeout: self.config.timeout,
        };

        let mut exec = match self.load().await {
            Ok(exec) => exec,
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "Failed to load run for execution");
                let _ = self
                    .deps
                    .repos
                    .runs
                    .transition_status(
                        &self.run_id,
                        &[RunStatus::Pending, RunStatus::Starting, RunStatus::Running],
                        RunStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await;
                return ExecutionOutcome {
                    run_id: self.run_id.clone(),
                    status: RunStatus::Failed,
                    phase: RunPhase::Terminal,
                    error: Some(e),
                };
            }
        };

        tracing::info!(
            run_id = %self.run_id,
            tag = exec.run.effective_tag(),
            mode = exec.run.mode.as_str(),
            resumed = self.resume_from.is_some(),
            "Run executor started"
        );

        let subtasks = scope.cancel.child_token();
        let heartbeat = Heartbeat::start(
            &self.run_id,
            self.deps.repos.runs.clone(),
            self.config.heartbeat_interval,
            &subtasks,
        );
        let checkpointer = exec
            .checkpoint
            .spawn_periodic(self.config.checkpoint_interval, subtasks.clone());

        let result = self.drive(&mut exec, &scope).await;

        subtasks.cancel();
        let beats = heartbeat.stop().await;
        if let Err(e) = checkpointer.await {
            tracing::warn!(run_id = %self.run_id, error = %e, "Checkpoint task panicked");
        }
        tracing::debug!(run_id = %self.run_id, beats, "Heartbeat stopped");

        self.finish(exec, result).await
    }

    async fn load(&self) -> Result<Execution, PhaseError> {
        let repos = &self.deps.repos;
        let run = repos
            .runs
            .get_run(&self.run_id)
            .await
            .map_err(PhaseError::database)?
            .ok_or_else(|| PhaseError::configuration(format!("run {} not found", self.run_id)))?;
        let task = repos
            .tasks
            .get_task(&run.task_id)
            .await
            .map_err(PhaseError::database)?
            .ok_or_else(|| PhaseError::configuration(format!("task {} not found", run.task_id)))?;
        let profile = repos
            .profiles
            .get_profile(&run.profile_id)
            .await
            .map_err(PhaseError::database)?
            .ok_or_else(|| {
                PhaseError::configuration(format!("profile {} not found", run.profile_id))
            })?;

        let initial = self
            .resume_from
            .clone()
            .unwrap_or_else(|| RunCheckpoint::queued(&run.id));
        // Locks never outlive an execution; a resumed run acquires its own.
        let checkpoint = CheckpointTracker::new(initial, Some(repos.checkpoints.clone()));
        let sink = StoreEventSink::spawn(&run.id, repos.events.clone(), self.deps.broadcaster.clone());

        Ok(Execution {
            run,
            task,
            profile,
            checkpoint,
            sink,
            runner: None,
            result: None,
            lock_id: None,
        })
    }

    async fn drive(&self, exec: &mut Execution, scope: &Scope) -> Result<Completion, PhaseError> {
        let mut completion = Completion::Complete;
        for phase in PHASES {
            scope.check()?;
            if self.should_skip_phase(exec, phase) {
                tracing::info!(run_id = %self.run_id, phase = phase.as_str(), "Skipping phase restored from checkpoint");
                self.restore_skipped(exec, phase).await?;
                continue;
            }
            self.enter_phase(exec, phase).await?;

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = match phase {
                    RunPhase::Initializing => scope.guard(self.initialize(exec)).await,
                    RunPhase::SandboxCreating => scope.guard(self.prepare_workspace(exec)).await,
                    RunPhase::RunnerAcquiring => scope.guard(self.acquire_runner(exec)).await,
                    RunPhase::Executing => self.run_agent(exec, scope).await,
                    _ => match scope.guard(self.collect_results(exec)).await {
                        Ok(c) => {
                            completion = c;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                };
                match result {
                    Ok(()) => break,
                    Err(e) if e.kind.is_retryable() && attempt <= self.config.max_retries => {
                        let delay = self.config.retry_backoff * attempt;
                        tracing::warn!(
                            run_id = %self.run_id,
                            phase = phase.as_str(),
                            attempt,
                            error = %e,
                            "Transient phase failure, retrying"
                        );
                        scope.guard(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(completion)
    }

    /// A phase is skipped only when the checkpoint reached it and the state it
    /// produces is still present on the run.
    fn should_skip_phase(&self, exec: &Execution, phase: RunPhase) -> bool {
        let Some(cp) = &self.resume_from else {
            return false;
        };
        if cp.phase < phase {
            return false;
        }
        let run = &exec.run;
        match phase {
            RunPhase::Initializing => run.started_at.is_some(),
            RunPhase::SandboxCreating => match run.mode {
                RunMode::Sandboxed => cp.sandbox_id.is_some() && cp.work_dir.is_some(),
                RunMode::InPlace => cp.work_dir.is_some(),
            },
            // Execution output survives only once collecting_results was reached.
            RunPhase::RunnerAcquiring | RunPhase::Executing => {
                cp.phase >= RunPhase::CollectingResults && run.exit_code == Some(0)
            }
            _ => false,
        }
    }

    async fn restore_skipped(&self, exec: &mut Execution, phase: RunPhase) -> Result<(), PhaseError> {
        match phase {
            RunPhase::SandboxCreating => {
                let cp = exec.checkpoint.snapshot().await;
                exec.run.sandbox_id = cp.sandbox_id.clone();
                exec.run.work_dir = cp.work_dir.clone();
                self.lock_scope(exec).await
            }
            RunPhase::Executing => {
                exec.result = Some(ExecuteResult {
                    exit_code: exec.run.exit_code.unwrap_or(0),
                    summary: exec.run.summary.clone(),
                    error: None,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn enter_phase(&self, exec: &mut Execution, phase: RunPhase) -> Result<(), PhaseError> {
        if phase >= exec.run.phase {
            exec.run.phase = phase;
            exec.run.progress_percent = phase.progress_percent();
        }
        exec.checkpoint.advance(phase).await?;
        self.persist(exec).await?;
        tracing::debug!(run_id = %self.run_id, phase = phase.as_str(), "Entered phase");
        Ok(())
    }

    /// Write the in-memory run. Fails as cancelled when the stored run was
    /// finalized by someone else.
    async fn persist(&self, exec: &mut Execution) -> Result<(), PhaseError> {
        let now = Utc::now();
        exec.run.updated_at = now;
        if exec.run.status.is_live() {
            exec.run.last_heartbeat = Some(now);
        }
        let written = self
            .deps
            .repos
            .runs
            .update_run(&exec.run)
            .await
            .map_err(PhaseError::database)?;
        if !written {
            let stored = self
                .deps
                .repos
                .runs
                .get_run(&exec.run.id)
                .await
                .map_err(PhaseError::database)?;
            let status = stored.map(|r| r.status).unwrap_or(RunStatus::Cancelled);
            return Err(PhaseError::cancelled(format!("run was finalized as {}", status)));
        }
        self.broadcast(&exec.run);
        Ok(())
    }

    fn broadcast(&self, run: &Run) {
        self.deps.broadcaster.broadcast_run_status(run);
        self.deps.broadcaster.broadcast_progress(
            &run.id,
            run.phase,
            run.progress_percent,
            run.phase.current_action(),
        );
    }

    fn scope_dir(&self, task: &Task) -> PathBuf {
        let root = PathBuf::from(&task.project_root);
        if task.scope_path.is_empty() || task.scope_path == "." {
            root
        } else {
            root.join(&task.scope_path)
        }
    }

    /// Take the scope lock for this run. Acquiring is reentrant for the
    /// run, so a lock already held is returned as is.
    async fn lock_scope(&self, exec: &mut Execution) -> Result<(), PhaseError> {
        let Some(locks) = &self.deps.locks else {
            return Ok(());
        };
        let lock_id = locks
            .acquire(&self.scope_dir(&exec.task), &exec.run.id)
            .await
            .map_err(|e| PhaseError::sandbox(format!("{:#}", e)))?;
        exec.lock_id = Some(lock_id.clone());
        exec.checkpoint.record_lock(Some(lock_id)).await
    }

    // ── Phases ────────────────────────────────────────────────────────

    async fn initialize(&self, exec: &mut Execution) -> Result<(), PhaseError> {
        let old = exec.run.status;
        if old == RunStatus::Pending {
            exec.run.status = RunStatus::Starting;
        }
        if exec.run.started_at.is_none() {
            exec.run.started_at = Some(Utc::now());
        }
        self.persist(exec).await?;
        if old != exec.run.status {
            exec.sink.emit(EventPayload::Status {
                old,
                new: exec.run.status,
            });
        }
        exec.sink.emit(EventPayload::system(format!(
            "Run started: {} ({} mode)",
            exec.task.title,
            exec.run.mode.as_str()
        )));
        if let Err(e) = self
            .deps
            .repos
            .tasks
            .update_task_status(&exec.task.id, TaskStatus::Running)
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Failed to mark task running");
        }
        Ok(())
    }

    async fn prepare_workspace(&self, exec: &mut Execution) -> Result<(), PhaseError> {
        let scope_dir = self.scope_dir(&exec.task);
        self.lock_scope(exec).await?;

        match exec.run.mode {
            RunMode::Sandboxed => {
                let sandbox = self.deps.sandbox.as_ref().ok_or_else(|| {
                    PhaseError::configuration("sandboxed mode requested but no sandbox provider is configured")
                })?;
                let request = SandboxRequest {
                    run_id: exec.run.id.clone(),
                    project_root: PathBuf::from(&exec.task.project_root),
                    scope_path: exec.task.scope_path.clone(),
                };
                let info = sandbox
                    .create(&request)
                    .await
                    .map_err(|e| PhaseError::sandbox(format!("{:#}", e)))?;
                exec.run.sandbox_id = Some(info.id.clone());
                exec.run.work_dir = Some(info.work_dir.to_string_lossy().into_owned());
                exec.checkpoint
                    .record_sandbox(Some(&info.id), &info.work_dir)
                    .await?;
                exec.sink.emit(EventPayload::system(format!(
                    "Sandbox {} created at {}",
                    info.id,
                    info.work_dir.display()
                )));
            }
            RunMode::InPlace => {
                let work_dir = if scope_dir.is_dir() {
                    scope_dir
                } else {
                    PathBuf::from(&exec.task.project_root)
                };
                exec.run.work_dir = Some(work_dir.to_string_lossy().into_owned());
                exec.checkpoint.record_sandbox(None, &work_dir).await?;
            }
        }
        self.persist(exec).await
    }

    async fn acquire_runner(&self, exec: &mut Execution) -> Result<(), PhaseError> {
        let kind = exec.profile.runner_kind;
        let runner = self.deps.runners.get(kind).ok_or_else(|| {
            PhaseError::configuration(format!("no runner registered for kind {}", kind))
        })?;
        let (available, message) = runner.is_available().await;
        if !available {
            return Err(PhaseError::configuration(format!(
                "runner {} unavailable: {}",
                kind, message
            )));
        }
        if exec.run.resolved_config.is_none() {
            exec.run.resolved_config = Some(ResolvedConfig {
                runner_kind: kind,
                model: exec.profile.model.clone(),
                max_turns: exec.profile.max_turns,
                requires_review: false,
            });
        }
        exec.runner = Some(runner);
        if exec.run.status == RunStatus::Starting {
            exec.run.status = RunStatus::Running;
            exec.sink.emit(EventPayload::Status {
                old: RunStatus::Starting,
                new: RunStatus::Running,
            });
        }
        self.persist(exec).await
    }

    /// The long call. Cancellation and the deadline are handled here rather
    /// than by dropping the future, so the runner gets a chance to stop.
    async fn run_agent(&self, exec: &mut Execution, scope: &Scope) -> Result<(), PhaseError> {
        let runner = exec
            .runner
            .clone()
            .ok_or_else(|| PhaseError::configuration("no runner acquired"))?;
        let work_dir = exec
            .run
            .work_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&exec.task.project_root));
        let request = ExecuteRequest {
            run_id: exec.run.id.clone(),
            tag: exec.run.effective_tag().to_string(),
            prompt: self
                .prompt
                .clone()
                .unwrap_or_else(|| exec.task.description.clone()),
            work_dir,
            profile: exec.profile.clone(),
            events: exec.sink.clone(),
        };

        let call = runner.execute(request);
        tokio::pin!(call);
        let interrupted = tokio::select! {
            biased;
            result = &mut call => {
                let result = result.map_err(|e| PhaseError::runner(format!("{:#}", e)))?;
                exec.run.exit_code = Some(result.exit_code);
                exec.result = Some(result);
                return Ok(());
            }
            _ = scope.cancel.cancelled() => PhaseError::cancelled("run cancelled during execution"),
            _ = tokio::time::sleep_until(scope.deadline) => scope.timeout_error(),
        };

        tracing::info!(run_id = %self.run_id, reason = %interrupted, "Stopping runner");
        match tokio::time::timeout(self.config.stop_grace, runner.stop(&exec.run.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Runner stop failed")
            }
            Err(_) => tracing::warn!(run_id = %self.run_id, "Runner stop timed out"),
        }
        if tokio::time::timeout(self.config.stop_grace, &mut call)
            .await
            .is_err()
        {
            tracing::warn!(run_id = %self.run_id, "Runner did not return within stop grace");
        }
        Err(interrupted)
    }

    async fn collect_results(&self, exec: &mut Execution) -> Result<Completion, PhaseError> {
        let result = exec
            .result
            .clone()
            .ok_or_else(|| PhaseError::runner("runner returned no result"))?;
        let mut summary = result.summary.clone().unwrap_or_default();

        if !result.succeeded() {
            if !summary.description.is_empty() {
                exec.run.summary = Some(summary);
            }
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("runner exited with code {}", result.exit_code));
            return Err(PhaseError::runner(message));
        }

        let mut completion = Completion::Complete;
        if exec.run.mode == RunMode::Sandboxed
            && let (Some(sandbox), Some(sandbox_id)) = (&self.deps.sandbox, &exec.run.sandbox_id)
        {
            let diff = sandbox
                .get_diff(sandbox_id)
                .await
                .map_err(|e| PhaseError::sandbox(format!("{:#}", e)))?;
            if summary.files_modified.is_empty() {
                summary.files_modified = diff.files.clone();
            }
            let requires_review = exec
                .run
                .resolved_config
                .as_ref()
                .is_some_and(|c| c.requires_review);
            if requires_review && !diff.is_empty() {
                completion = Completion::AwaitingReview;
            }
        }
        exec.run.summary = Some(summary);
        self.persist(exec).await?;
        Ok(completion)
    }

    // ── Terminal write ────────────────────────────────────────────────

    async fn finish(
        &self,
        mut exec: Execution,
        result: Result<Completion, PhaseError>,
    ) -> ExecutionOutcome {
        let old = exec.run.status;
        let now = Utc::now();
        let error = result.as_ref().err().cloned();

        match &result {
            Ok(Completion::Complete) => {
                exec.run.status = RunStatus::Complete;
                exec.run.phase = RunPhase::Terminal;
                exec.run.progress_percent = 100;
                if exec.run.effective_tag().starts_with(INVESTIGATION_TAG_PREFIX) {
                    exec.run.recommendation.status = RecommendationStatus::Pending;
                    exec.run.recommendation.attempts = 0;
                    exec.run.recommendation.queued_at = Some(now);
                }
            }
            Ok(Completion::AwaitingReview) => {
                exec.run.status = RunStatus::Complete;
                exec.run.phase = RunPhase::AwaitingReview;
                exec.run.progress_percent = RunPhase::AwaitingReview.progress_percent();
                exec.run.approval_state = ApprovalState::Pending;
            }
            Err(e) if e.kind == FailureKind::Cancelled => {
                exec.run.status = RunStatus::Cancelled;
                exec.run.phase = RunPhase::Terminal;
                exec.run.error_message = Some(e.message.clone());
            }
            Err(e) => {
                exec.run.status = RunStatus::Failed;
                exec.run.phase = RunPhase::Terminal;
                exec.run.error_message = Some(e.to_string());
            }
        }
        exec.run.ended_at = Some(now);
        exec.run.updated_at = now;

        if let Err(e) = &result
            && e.kind != FailureKind::Cancelled
        {
            exec.sink.emit(EventPayload::Error {
                code: e.kind.as_str().to_string(),
                message: e.message.clone(),
            });
        }
        if old != exec.run.status {
            exec.sink.emit(EventPayload::Status {
                old,
                new: exec.run.status,
            });
        }
        if let Err(e) = exec.sink.flush().await {
            tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Failed to flush run events");
        }

        let written = match self.deps.repos.runs.update_run(&exec.run).await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %format!("{:#}", e), "Failed to write terminal run state");
                false
            }
        };
        let final_run = if written {
            exec.run.clone()
        } else {
            match self.deps.repos.runs.get_run(&self.run_id).await {
                Ok(Some(stored)) => stored,
                _ => exec.run.clone(),
            }
        };
        self.broadcast(&final_run);

        self.release(&mut exec, &final_run).await;
        if let Err(e) = exec.sink.close().await {
            tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Event writer did not close cleanly");
        }

        match &error {
            None => tracing::info!(run_id = %self.run_id, status = final_run.status.as_str(), phase = final_run.phase.as_str(), "Run finished"),
            Some(e) => tracing::warn!(run_id = %self.run_id, status = final_run.status.as_str(), error = %e, "Run did not complete"),
        }

        ExecutionOutcome {
            run_id: self.run_id.clone(),
            status: final_run.status,
            phase: final_run.phase,
            error,
        }
    }

    /// Release run resources according to the final state: failures keep
    /// their sandbox and checkpoint, cancelled and completed runs drop both,
    /// runs awaiting review keep the sandbox for approval.
    async fn release(&self, exec: &mut Execution, run: &Run) {
        if let (Some(locks), Some(lock_id)) = (&self.deps.locks, exec.lock_id.take()) {
            if let Err(e) = locks.release(&lock_id).await {
                tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Failed to release workspace lock");
            }
            // The kept checkpoint must not claim a lock nobody holds.
            if let Err(e) = exec.checkpoint.record_lock(None).await {
                tracing::warn!(run_id = %self.run_id, error = %e, "Failed to clear checkpoint lock");
            }
        }

        let destroy_sandbox = match run.status {
            RunStatus::Complete => run.phase == RunPhase::Terminal,
            RunStatus::Cancelled => true,
            _ => false,
        };
        if destroy_sandbox
            && let (Some(sandbox), Some(sandbox_id)) = (&self.deps.sandbox, &run.sandbox_id)
            && let Err(e) = sandbox.destroy(sandbox_id).await
        {
            tracing::warn!(run_id = %self.run_id, sandbox_id = %sandbox_id, error = %format!("{:#}", e), "Failed to destroy sandbox");
        }
        if matches!(run.status, RunStatus::Complete | RunStatus::Cancelled) {
            exec.checkpoint.discard().await;
        }

        let task_status = match (run.status, run.phase) {
            (RunStatus::Complete, RunPhase::Terminal) => Some(TaskStatus::Completed),
            (RunStatus::Complete, _) => None,
            _ => Some(TaskStatus::Queued),
        };
        if let Some(status) = task_status
            && let Err(e) = self
                .deps
                .repos
                .tasks
                .update_task_status(&run.task_id, status)
                .await
        {
            tracing::warn!(run_id = %self.run_id, error = %format!("{:#}", e), "Failed to update task status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::runner::RunnerCapabilities;
    use crate::adapters::{MemoryLockManager, NullBroadcaster};
    use crate::domain::{EventType, RunnerKind};
    use crate::store::EventQuery;
    use crate::store::testing::{sample_profile, sample_task};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

    struct ScriptedRunner {
        delay: Duration,
        exit_code: AtomicI32,
        calls: AtomicUsize,
        stops: AtomicUsize,
        /// Scope whose lock state is sampled on every execute.
        watch: Mutex<Option<(Arc<MemoryLockManager>, PathBuf)>>,
        held_during_execute: Mutex<Vec<bool>>,
    }

    impl ScriptedRunner {
        fn new(delay: Duration, exit_code: i32) -> Arc<Self> {
            Arc::new(Self {
                delay,
                exit_code: AtomicI32::new(exit_code),
                calls: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                watch: Mutex::new(None),
                held_during_execute: Mutex::new(Vec::new()),
            })
        }

        fn watch_scope(&self, locks: Arc<MemoryLockManager>, scope: PathBuf) {
            *self.watch.lock().unwrap() = Some((locks, scope));
        }

        fn held_samples(&self) -> Vec<bool> {
            self.held_during_execute.lock().unwrap().clone()
        }
    }

    /// Sandbox provider that counts lifecycle calls and hands out the
    /// project root as the work directory.
    #[derive(Default)]
    struct CountingSandbox {
        creates: AtomicUsize,
        destroys: Mutex<Vec<String>>,
        fail_next_create: AtomicBool,
    }

    impl CountingSandbox {
        fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }

        fn destroyed(&self) -> Vec<String> {
            self.destroys.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SandboxProvider for CountingSandbox {
        async fn is_available(&self) -> bool {
            true
        }

        async fn create(&self, request: &SandboxRequest) -> Result<crate::adapters::SandboxInfo> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_next_create.swap(false, Ordering::SeqCst) {
                anyhow::bail!("worktree add failed");
            }
            Ok(crate::adapters::SandboxInfo {
                id: format!("sb-{}", n),
                work_dir: request.project_root.clone(),
            })
        }

        async fn get_diff(&self, _sandbox_id: &str) -> Result<crate::adapters::SandboxDiff> {
            Ok(crate::adapters::SandboxDiff::default())
        }

        async fn apply(&self, _sandbox_id: &str, _paths: Option<&[String]>) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn destroy(&self, sandbox_id: &str) -> Result<()> {
            self.destroys.lock().unwrap().push(sandbox_id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
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
            (true, "ok".into())
        }

        async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let watched = self.watch.lock().unwrap().clone();
            if let Some((locks, scope)) = watched {
                self.held_during_execute.lock().unwrap().push(locks.is_held(&scope));
            }
            request.events.emit(EventPayload::assistant("working"));
            tokio::time::sleep(self.delay).await;
            Ok(ExecuteResult {
                exit_code: self.exit_code.load(Ordering::SeqCst),
                summary: Some(crate::domain::RunSummary {
                    description: "done".into(),
                    ..Default::default()
                }),
                error: None,
            })
        }

        async fn stop(&self, _run_id: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup(
        runner: Arc<ScriptedRunner>,
        mode: RunMode,
    ) -> Result<(ExecutorDeps, Run, tempfile::TempDir)> {
        let repos = Repositories::in_memory()?;
        let dir = tempfile::tempdir()?;
        let profile = sample_profile("p");
        let mut task = sample_task("t");
        task.project_root = dir.path().to_string_lossy().into_owned();
        repos.profiles.create_profile(&profile).await?;
        repos.tasks.create_task(&task).await?;
        let run = Run::new(&task.id, &profile.id, mode);
        repos.runs.create_run(&run).await?;
        let deps = ExecutorDeps {
            repos,
            runners: RunnerRegistry::new().with(runner),
            sandbox: None,
            locks: Some(Arc::new(MemoryLockManager::new())),
            broadcaster: Arc::new(NullBroadcaster),
        };
        Ok((deps, run, dir))
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig::default()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_stop_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_successful_run_reaches_complete() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(50), 0);
        let (deps, run, _dir) = setup(runner.clone(), RunMode::InPlace).await?;
        let repos = deps.repos.clone();

        let outcome = RunExecutor::new(&run.id, fast_config(), deps)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Complete);
        assert!(outcome.error.is_none());

        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert_eq!(stored.phase, RunPhase::Terminal);
        assert_eq!(stored.progress_percent, 100);
        assert!(stored.started_at.is_some());
        assert!(stored.ended_at.is_some());
        assert!(stored.last_heartbeat.is_some());
        assert_eq!(stored.exit_code, Some(0));
        assert_eq!(stored.summary.unwrap().description, "done");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let task = repos.tasks.get_task(&run.task_id).await?.expect("task");
        assert_eq!(task.status, TaskStatus::Completed);

        let events = repos.events.get_events(&run.id, &EventQuery::default()).await?;
        assert!(events.iter().any(|e| e.payload == EventPayload::assistant("working")));
        assert!(events.iter().any(|e| e.payload.event_type() == EventType::Status));
        Ok(())
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_as_runner_error() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(5), 2);
        let (deps, run, _dir) = setup(runner, RunMode::InPlace).await?;
        let repos = deps.repos.clone();

        let outcome = RunExecutor::new(&run.id, fast_config(), deps)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Runner);

        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert!(stored.error_message.unwrap().contains("exited with code 2"));
        // Failure keeps the checkpoint at the failing phase.
        let cp = repos.checkpoints.get_checkpoint(&run.id).await?.expect("checkpoint");
        assert_eq!(cp.phase, RunPhase::CollectingResults);
        let task = repos.tasks.get_task(&run.task_id).await?.expect("task");
        assert_eq!(task.status, TaskStatus::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_runner_is_configuration_failure() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::ZERO, 0);
        let (mut deps, run, _dir) = setup(runner, RunMode::InPlace).await?;
        deps.runners = RunnerRegistry::new();

        let outcome = RunExecutor::new(&run.id, fast_config(), deps)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Configuration);
        Ok(())
    }

    #[tokio::test]
    async fn test_sandboxed_without_provider_fails() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::ZERO, 0);
        let (deps, run, _dir) = setup(runner.clone(), RunMode::Sandboxed).await?;

        let outcome = RunExecutor::new(&run.id, fast_config(), deps)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Configuration);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_mid_execution_stops_runner() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let (deps, run, _dir) = setup(runner.clone(), RunMode::InPlace).await?;
        let repos = deps.repos.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(RunExecutor::new(&run.id, fast_config(), deps).execute(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await??;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(runner.stops.load(Ordering::SeqCst), 1);
        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.ended_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_fails_with_timeout() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let (deps, run, _dir) = setup(runner, RunMode::InPlace).await?;

        let config = fast_config().with_timeout(Duration::from_millis(150));
        let outcome = RunExecutor::new(&run.id, config, deps)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Timeout);
        Ok(())
    }

    #[tokio::test]
    async fn test_investigation_run_is_queued_for_extraction() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(5), 0);
        let (deps, mut run, _dir) = setup(runner, RunMode::InPlace).await?;
        let repos = deps.repos.clone();
        run.tag = Some(format!("{}-abc", INVESTIGATION_TAG_PREFIX));
        repos.runs.update_run(&run).await?;

        RunExecutor::new(&run.id, fast_config(), deps)
            .execute(CancellationToken::new())
            .await;
        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert_eq!(stored.recommendation.status, RecommendationStatus::Pending);
        assert!(stored.recommendation.queued_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_past_execution_does_not_rerun_agent() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(5), 0);
        let (deps, mut run, dir) = setup(runner.clone(), RunMode::InPlace).await?;
        let repos = deps.repos.clone();

        run.status = RunStatus::Running;
        run.phase = RunPhase::CollectingResults;
        run.started_at = Some(Utc::now());
        run.exit_code = Some(0);
        run.summary = Some(crate::domain::RunSummary {
            description: "earlier".into(),
            ..Default::default()
        });
        repos.runs.update_run(&run).await?;
        let mut cp = RunCheckpoint::queued(&run.id);
        cp.phase = RunPhase::CollectingResults;
        cp.work_dir = Some(dir.path().to_string_lossy().into_owned());

        let outcome = RunExecutor::new(&run.id, fast_config(), deps)
            .with_resume(cp)
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert_eq!(stored.summary.unwrap().description, "earlier");
        Ok(())
    }

    async fn sandboxed(
        runner: Arc<ScriptedRunner>,
    ) -> Result<(ExecutorDeps, Run, tempfile::TempDir, Arc<CountingSandbox>, Arc<MemoryLockManager>)> {
        let (mut deps, run, dir) = setup(runner, RunMode::Sandboxed).await?;
        let sandbox = Arc::new(CountingSandbox::default());
        let locks = Arc::new(MemoryLockManager::new());
        deps.sandbox = Some(sandbox.clone());
        deps.locks = Some(locks.clone());
        Ok((deps, run, dir, sandbox, locks))
    }

    async fn resume(deps: ExecutorDeps, run_id: &str) -> Result<ExecutionOutcome> {
        let cp = deps
            .repos
            .checkpoints
            .get_checkpoint(run_id)
            .await?
            .expect("checkpoint");
        assert!(deps.repos.runs.reopen_for_resume(run_id, cp.phase).await?);
        Ok(RunExecutor::new(run_id, fast_config(), deps)
            .with_resume(cp)
            .execute(CancellationToken::new())
            .await)
    }

    #[tokio::test]
    async fn test_sandbox_create_failure_then_resume_holds_scope_lock() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(5), 0);
        let (deps, run, dir, sandbox, locks) = sandboxed(runner.clone()).await?;
        let repos = deps.repos.clone();
        runner.watch_scope(locks.clone(), dir.path().join("src"));
        sandbox.fail_next_create.store(true, Ordering::SeqCst);

        let outcome = RunExecutor::new(&run.id, fast_config(), deps.clone())
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Sandbox);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(locks.held_count(), 0);
        let cp = repos.checkpoints.get_checkpoint(&run.id).await?.expect("checkpoint");
        assert_eq!(cp.phase, RunPhase::SandboxCreating);
        assert!(cp.lock_id.is_none());
        assert!(cp.sandbox_id.is_none());

        let outcome = resume(deps, &run.id).await?;
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(runner.held_samples(), vec![true]);
        assert_eq!(sandbox.creates(), 2);
        assert_eq!(sandbox.destroyed(), vec!["sb-2".to_string()]);
        assert_eq!(locks.held_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_failure_keeps_sandbox_and_resume_reuses_it() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_millis(5), 2);
        let (deps, run, dir, sandbox, locks) = sandboxed(runner.clone()).await?;
        let repos = deps.repos.clone();
        runner.watch_scope(locks.clone(), dir.path().join("src"));

        let outcome = RunExecutor::new(&run.id, fast_config(), deps.clone())
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().kind, FailureKind::Runner);
        assert_eq!(sandbox.creates(), 1);
        assert!(sandbox.destroyed().is_empty());
        let cp = repos.checkpoints.get_checkpoint(&run.id).await?.expect("checkpoint");
        assert_eq!(cp.sandbox_id.as_deref(), Some("sb-1"));
        assert!(cp.lock_id.is_none());

        runner.exit_code.store(0, Ordering::SeqCst);
        let outcome = resume(deps, &run.id).await?;
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.held_samples(), vec![true, true]);
        // One sandbox across the whole fail, resume, complete sequence.
        assert_eq!(sandbox.creates(), 1);
        assert_eq!(sandbox.destroyed(), vec!["sb-1".to_string()]);
        let stored = repos.runs.get_run(&run.id).await?.expect("run");
        assert_eq!(stored.sandbox_id.as_deref(), Some("sb-1"));
        assert!(repos.checkpoints.get_checkpoint(&run.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_destroys_sandbox() -> Result<()> {
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let (deps, run, _dir, sandbox, locks) = sandboxed(runner).await?;
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(RunExecutor::new(&run.id, fast_config(), deps).execute(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await??;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(sandbox.creates(), 1);
        assert_eq!(sandbox.destroyed(), vec!["sb-1".to_string()]);
        assert_eq!(locks.held_count(), 0);
        Ok(())
    }
}
