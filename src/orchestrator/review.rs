//! Change review for sandboxed runs, and service health.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;

use super::{Orchestrator, Result};
use crate::adapters::{SandboxDiff, SandboxProvider};
use crate::domain::{ApprovalState, EventPayload, Run, RunPhase, RunnerKind, TaskStatus};
use crate::errors::OrchestratorError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerHealth {
    pub kind: RunnerKind,
    pub available: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub runners: Vec<RunnerHealth>,
    /// `None` when no sandbox provider is configured.
    pub sandbox_available: Option<bool>,
    pub active_runs: usize,
}

impl Orchestrator {
    /// Apply the sandbox diff, all of it or only `paths`, and finish the
    /// run.
    pub async fn approve_run(&self, run_id: &str, paths: Option<Vec<String>>) -> Result<Run> {
        let _review = self.reviews.lock().await;
        let mut run = self.reviewable_run(run_id).await?;
        let sandbox = self.sandbox_provider()?;
        let sandbox_id = run.sandbox_id.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("run {} has no sandbox", run_id))
        })?;

        let diff = sandbox
            .get_diff(&sandbox_id)
            .await
            .map_err(|e| OrchestratorError::Sandbox(format!("{:#}", e)))?;
        let selected = paths.filter(|p| !p.is_empty());
        let approval = approval_for(&diff, selected.as_deref());

        self.set_review(&mut run, RunPhase::AwaitingReview, RunPhase::Applying, ApprovalState::Pending)
            .await?;

        let applied = match sandbox.apply(&sandbox_id, selected.as_deref()).await {
            Ok(applied) => applied,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(run_id, error = %message, "Applying approved changes failed");
                // Return to review; the decision stays open.
                if let Err(restore) = self
                    .set_review(&mut run, RunPhase::Applying, RunPhase::AwaitingReview, ApprovalState::Pending)
                    .await
                {
                    tracing::error!(run_id, error = %restore, "Failed to return run to review");
                }
                self.append_review_event(run_id, format!("applying changes failed: {}", message))
                    .await;
                return Err(OrchestratorError::Sandbox(message));
            }
        };
        tracing::info!(run_id, files = applied.len(), approval = approval.as_str(), "Approved changes applied");

        self.set_review(&mut run, RunPhase::Applying, RunPhase::Terminal, approval)
            .await?;

        self.append_review_event(
            run_id,
            format!("approved {} of {} changed file(s)", applied.len(), diff.files.len()),
        )
        .await;
        self.close_review(&run, sandbox.as_ref(), &sandbox_id, TaskStatus::Completed)
            .await;
        Ok(run)
    }

    /// Discard the sandbox changes and finish the run.
    pub async fn reject_run(&self, run_id: &str, reason: Option<String>) -> Result<Run> {
        let _review = self.reviews.lock().await;
        let mut run = self.reviewable_run(run_id).await?;
        let sandbox = self.sandbox_provider()?;

        self.set_review(&mut run, RunPhase::AwaitingReview, RunPhase::Terminal, ApprovalState::Rejected)
            .await?;
        tracing::info!(run_id, reason = reason.as_deref().unwrap_or(""), "Changes rejected");

        let message = match &reason {
            Some(reason) => format!("changes rejected: {}", reason),
            None => "changes rejected".to_string(),
        };
        self.append_review_event(run_id, message).await;
        if let Some(sandbox_id) = run.sandbox_id.clone() {
            self.close_review(&run, sandbox.as_ref(), &sandbox_id, TaskStatus::Queued)
                .await;
        }
        Ok(run)
    }

    pub async fn get_run_diff(&self, run_id: &str) -> Result<SandboxDiff> {
        let run = self.get_run(run_id).await?;
        let sandbox_id = run.sandbox_id.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("run {} has no sandbox", run_id))
        })?;
        self.sandbox_provider()?
            .get_diff(&sandbox_id)
            .await
            .map_err(|e| OrchestratorError::Sandbox(format!("{:#}", e)))
    }

    pub async fn health(&self) -> HealthReport {
        let mut runners = Vec::new();
        for kind in self.deps.runners.kinds() {
            if let Some(runner) = self.deps.runners.get(kind) {
                let (available, message) = runner.is_available().await;
                runners.push(RunnerHealth {
                    kind,
                    available,
                    message,
                });
            }
        }
        let sandbox_available = match &self.deps.sandbox {
            Some(sandbox) => Some(sandbox.is_available().await),
            None => None,
        };

        let healthy = !runners.is_empty()
            && runners.iter().any(|r| r.available)
            && sandbox_available != Some(false);
        HealthReport {
            status: if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            runners,
            sandbox_available,
            active_runs: self.active_runs(),
        }
    }

    async fn reviewable_run(&self, run_id: &str) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        if run.phase != RunPhase::AwaitingReview || run.approval_state != ApprovalState::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is not awaiting review (phase {}, approval {})",
                run_id,
                run.phase,
                run.approval_state.as_str()
            )));
        }
        Ok(run)
    }

    fn sandbox_provider(&self) -> Result<std::sync::Arc<dyn SandboxProvider>> {
        self.deps.sandbox.clone().ok_or_else(|| {
            OrchestratorError::Configuration("no sandbox provider is configured".to_string())
        })
    }

    /// Store a review transition and mirror it onto `run`. Other columns,
    /// recommendation state included, are left as stored.
    async fn set_review(
        &self,
        run: &mut Run,
        from: RunPhase,
        phase: RunPhase,
        approval: ApprovalState,
    ) -> Result<()> {
        let written = self
            .deps
            .repos
            .runs
            .update_review(&run.id, from, phase, approval)
            .await
            .map_err(OrchestratorError::Database)?;
        if !written {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} changed state during review",
                run.id
            )));
        }
        run.phase = phase;
        run.progress_percent = phase.progress_percent();
        run.approval_state = approval;
        run.updated_at = Utc::now();
        self.deps.broadcaster.broadcast_run_status(run);
        self.deps.broadcaster.broadcast_progress(
            &run.id,
            run.phase,
            run.progress_percent,
            run.phase.current_action(),
        );
        Ok(())
    }

    async fn append_review_event(&self, run_id: &str, message: String) {
        match self
            .deps
            .repos
            .events
            .append(run_id, EventPayload::system(message))
            .await
        {
            Ok(event) => self.deps.broadcaster.broadcast_event(&event),
            Err(e) => {
                tracing::warn!(run_id, error = %format!("{:#}", e), "Failed to record review event")
            }
        }
    }

    /// Best-effort cleanup once a review decision is stored.
    async fn close_review(
        &self,
        run: &Run,
        sandbox: &dyn SandboxProvider,
        sandbox_id: &str,
        task_status: TaskStatus,
    ) {
        if let Err(e) = sandbox.destroy(sandbox_id).await {
            tracing::warn!(run_id = %run.id, sandbox_id, error = %format!("{:#}", e), "Failed to destroy sandbox");
        }
        if let Err(e) = self.deps.repos.checkpoints.delete_checkpoint(&run.id).await {
            tracing::warn!(run_id = %run.id, error = %format!("{:#}", e), "Failed to delete checkpoint");
        }
        if let Err(e) = self
            .deps
            .repos
            .tasks
            .update_task_status(&run.task_id, task_status)
            .await
        {
            tracing::warn!(task_id = %run.task_id, error = %format!("{:#}", e), "Failed to update task status");
        }
    }
}

/// `partial` when the selection leaves some changed file out.
fn approval_for(diff: &SandboxDiff, selected: Option<&[String]>) -> ApprovalState {
    match selected {
        None => ApprovalState::Approved,
        Some(paths) => {
            let chosen: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
            if diff.files.iter().all(|f| chosen.contains(f.as_str())) {
                ApprovalState::Approved
            } else {
                ApprovalState::Partial
            }
        }
    }
}
