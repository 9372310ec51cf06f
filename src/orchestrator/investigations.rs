//! Investigations: agent runs that analyze other runs.
//!
//! An investigation owns one child run tagged with the investigation
//! prefix. The child run's state is folded back into the investigation by
//! [`Orchestrator::sync_investigation`], and a completed child run is
//! queued for recommendation extraction by the executor.

use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{CreateRunRequest, Orchestrator, Result};
use crate::domain::tags::investigation_tag;
use crate::domain::{
    AnalysisFlags, Investigation, InvestigationFindings, InvestigationStatus, ReportFlags, Run,
    RunStatus, TaskInput,
};
use crate::errors::{ErrorKind, OrchestratorError};

/// Tag prefix of runs that apply an investigation's fixes.
pub const FIX_TAG_PREFIX: &str = "agent-manager-fix";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInvestigationRequest {
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub analysis: AnalysisFlags,
    #[serde(default)]
    pub report: ReportFlags,
    pub profile_id: String,
}

impl Orchestrator {
    pub async fn create_investigation(
        &self,
        request: CreateInvestigationRequest,
    ) -> Result<Investigation> {
        if request.run_ids.is_empty() {
            return Err(OrchestratorError::Validation(
                "an investigation needs at least one run".to_string(),
            ));
        }
        let mut targets = Vec::with_capacity(request.run_ids.len());
        for run_id in &request.run_ids {
            targets.push(self.get_run(run_id).await?);
        }
        self.get_profile(&request.profile_id).await?;

        let mut investigation =
            Investigation::new(request.run_ids.clone(), request.analysis, request.report);
        self.deps
            .repos
            .investigations
            .create_investigation(&investigation)
            .await
            .map_err(OrchestratorError::Database)?;

        let prompt = build_investigation_prompt(&investigation, &targets);
        let tag = investigation_tag(&investigation.id);
        let spawned = self
            .spawn_agent_run(
                &targets[0],
                format!("Investigate {} run(s)", targets.len()),
                prompt,
                &request.profile_id,
                tag,
                true,
            )
            .await;
        self.attach_child_run(&mut investigation, spawned).await?;
        tracing::info!(
            investigation_id = %investigation.id,
            runs = investigation.run_ids.len(),
            "Investigation started"
        );
        Ok(investigation)
    }

    /// Start a follow-up investigation whose agent applies the given
    /// recommendations from a completed one.
    pub async fn apply_investigation_fixes(
        &self,
        investigation_id: &str,
        recommendations: Vec<String>,
        profile_id: Option<String>,
    ) -> Result<Investigation> {
        let source = self.get_investigation(investigation_id).await?;
        if source.status != InvestigationStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "investigation {} is {}, fixes need a completed investigation",
                investigation_id,
                source.status.as_str()
            )));
        }
        let recommendations: Vec<String> = recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if recommendations.is_empty() {
            return Err(OrchestratorError::Validation(
                "no recommendations to apply".to_string(),
            ));
        }

        let profile_id = match profile_id {
            Some(id) => id,
            None => {
                let child = source.agent_run_id.as_deref().ok_or_else(|| {
                    OrchestratorError::Validation(
                        "a profile is required when the investigation has no agent run".into(),
                    )
                })?;
                self.get_run(child).await?.profile_id
            }
        };
        let target_id = source.run_ids.first().ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "investigation {} has no target runs",
                investigation_id
            ))
        })?;
        let target = self.get_run(target_id).await?;

        let mut follow_up = Investigation::new(
            source.run_ids.clone(),
            source.analysis.clone(),
            source.report.clone(),
        );
        follow_up.source_investigation_id = Some(source.id.clone());
        self.deps
            .repos
            .investigations
            .create_investigation(&follow_up)
            .await
            .map_err(OrchestratorError::Database)?;

        let prompt = build_fix_prompt(&source, &recommendations);
        let spawned = self
            .spawn_agent_run(
                &target,
                format!("Apply {} fix(es)", recommendations.len()),
                prompt,
                &profile_id,
                format!("{}-{}", FIX_TAG_PREFIX, follow_up.id),
                false,
            )
            .await;
        self.attach_child_run(&mut follow_up, spawned).await?;
        tracing::info!(
            investigation_id = %follow_up.id,
            source = %source.id,
            fixes = recommendations.len(),
            "Fix application started"
        );
        Ok(follow_up)
    }

    /// Fold the child run's current state into the investigation.
    pub async fn sync_investigation(&self, investigation_id: &str) -> Result<Investigation> {
        let mut investigation = self.get_investigation(investigation_id).await?;
        if investigation.status.is_terminal() {
            return Ok(investigation);
        }
        let Some(run_id) = investigation.agent_run_id.clone() else {
            return Ok(investigation);
        };
        let run = self.get_run(&run_id).await?;

        let before = (investigation.status, investigation.progress);
        match run.status {
            RunStatus::Pending | RunStatus::Starting | RunStatus::Running => {
                investigation.status = InvestigationStatus::Running;
                investigation.progress = run.progress_percent.min(99);
            }
            RunStatus::Complete => {
                investigation.status = InvestigationStatus::Completed;
                investigation.progress = 100;
                investigation.findings = Some(findings_from_run(&run));
            }
            RunStatus::Failed => {
                investigation.status = InvestigationStatus::Failed;
                investigation.error_message = run
                    .error_message
                    .clone()
                    .or_else(|| Some("investigation run failed".to_string()));
            }
            RunStatus::Cancelled => {
                investigation.status = InvestigationStatus::Cancelled;
            }
        }
        if before != (investigation.status, investigation.progress) {
            investigation.updated_at = Utc::now();
            self.store_investigation(&investigation).await?;
            tracing::debug!(
                investigation_id,
                status = investigation.status.as_str(),
                progress = investigation.progress,
                "Investigation synced"
            );
        }
        Ok(investigation)
    }

    pub async fn cancel_investigation(&self, investigation_id: &str) -> Result<Investigation> {
        let mut investigation = self.get_investigation(investigation_id).await?;
        if investigation.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "investigation {} is already {}",
                investigation_id,
                investigation.status.as_str()
            )));
        }
        if let Some(run_id) = investigation.agent_run_id.clone() {
            match self.stop_run(&run_id).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::InvalidState => {}
                Err(e) => return Err(e),
            }
        }
        investigation.status = InvestigationStatus::Cancelled;
        investigation.updated_at = Utc::now();
        self.store_investigation(&investigation).await?;
        tracing::info!(investigation_id, "Investigation cancelled");
        Ok(investigation)
    }

    pub async fn get_investigation(&self, investigation_id: &str) -> Result<Investigation> {
        self.deps
            .repos
            .investigations
            .get_investigation(investigation_id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("investigation", investigation_id))
    }

    pub async fn list_investigations(&self) -> Result<Vec<Investigation>> {
        self.deps
            .repos
            .investigations
            .list_investigations()
            .await
            .map_err(OrchestratorError::Database)
    }

    pub async fn delete_investigation(&self, investigation_id: &str) -> Result<()> {
        let investigation = self.get_investigation(investigation_id).await?;
        if !investigation.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "investigation {} is {}",
                investigation_id,
                investigation.status.as_str()
            )));
        }
        self.deps
            .repos
            .investigations
            .delete_investigation(investigation_id)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    /// Create the task and run for an investigation agent and dispatch it.
    async fn spawn_agent_run(
        &self,
        target: &Run,
        title: String,
        prompt: String,
        profile_id: &str,
        tag: String,
        in_place: bool,
    ) -> Result<Run> {
        let target_task = self.get_task(&target.task_id).await?;
        let task = self
            .create_task(TaskInput {
                title,
                description: prompt,
                scope_path: target_task.scope_path,
                project_root: target_task.project_root,
            })
            .await?;

        let mut request = CreateRunRequest::new(&task.id, profile_id);
        request.force_in_place = in_place;
        let run = self.admit_and_persist(&request, None, Some(tag)).await?;
        self.dispatch(&run.id, None, None);
        Ok(run)
    }

    /// Record the spawned child run, or the reason it could not start.
    async fn attach_child_run(
        &self,
        investigation: &mut Investigation,
        spawned: Result<Run>,
    ) -> Result<()> {
        match spawned {
            Ok(run) => {
                investigation.agent_run_id = Some(run.id);
                investigation.status = InvestigationStatus::Running;
                investigation.updated_at = Utc::now();
                self.store_investigation(investigation).await
            }
            Err(e) => {
                investigation.status = InvestigationStatus::Failed;
                investigation.error_message = Some(e.to_string());
                investigation.updated_at = Utc::now();
                if let Err(store) = self.store_investigation(investigation).await {
                    tracing::warn!(investigation_id = %investigation.id, error = %store, "Failed to record investigation failure");
                }
                Err(e)
            }
        }
    }

    async fn store_investigation(&self, investigation: &Investigation) -> Result<()> {
        self.deps
            .repos
            .investigations
            .update_investigation(investigation)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }
}

/// Analysis prompt listing each target run with what is known about it.
pub fn build_investigation_prompt(investigation: &Investigation, runs: &[Run]) -> String {
    let mut prompt = String::from(
        "You are investigating the execution of previous agent runs. \
         Read their events and workspace, then write a report.\n\n## Runs\n",
    );
    for run in runs {
        let _ = writeln!(prompt, "\n### Run {}", run.id);
        let _ = writeln!(prompt, "- status: {}", run.status);
        let _ = writeln!(prompt, "- phase: {}", run.phase);
        if let Some(code) = run.exit_code {
            let _ = writeln!(prompt, "- exit code: {}", code);
        }
        if let Some(error) = &run.error_message {
            let _ = writeln!(prompt, "- error: {}", error);
        }
        if let Some(summary) = &run.summary
            && !summary.description.is_empty()
        {
            let _ = writeln!(prompt, "- summary: {}", summary.description);
        }
    }

    let analysis = &investigation.analysis;
    let focus: Vec<&str> = [
        (analysis.errors, "errors and their causes"),
        (analysis.performance, "performance and wasted turns"),
        (analysis.tool_usage, "tool usage patterns"),
        (analysis.prompt_quality, "prompt quality"),
    ]
    .into_iter()
    .filter_map(|(on, label)| on.then_some(label))
    .collect();
    if !focus.is_empty() {
        let _ = writeln!(prompt, "\n## Focus\n{}", focus.join(", "));
    }

    let report = &investigation.report;
    let sections: Vec<&str> = [
        (report.summary, "Summary"),
        (report.root_cause, "Root cause"),
        (report.recommendations, "Recommendations"),
        (report.metrics, "Metrics"),
    ]
    .into_iter()
    .filter_map(|(on, label)| on.then_some(label))
    .collect();
    if !sections.is_empty() {
        let _ = writeln!(
            prompt,
            "\n## Report sections\nStructure the report with these headings: {}.",
            sections.join(", ")
        );
    }
    prompt
}

fn build_fix_prompt(source: &Investigation, recommendations: &[String]) -> String {
    let mut prompt = String::from("Apply the following fixes identified by an earlier investigation.\n\n## Fixes\n");
    for (i, rec) in recommendations.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", i + 1, rec);
    }
    if let Some(findings) = &source.findings
        && !findings.report.is_empty()
    {
        let _ = writeln!(prompt, "\n## Investigation report\n{}", findings.report);
    }
    prompt
}

fn findings_from_run(run: &Run) -> InvestigationFindings {
    let mut metrics = serde_json::Map::new();
    let report = match &run.summary {
        Some(summary) => {
            metrics.insert("turns".into(), summary.turns.into());
            metrics.insert("tool_calls".into(), summary.tool_calls.into());
            metrics.insert("files_modified".into(), summary.files_modified.len().into());
            summary.description.clone()
        }
        None => String::new(),
    };
    if let (Some(started), Some(ended)) = (run.started_at, run.ended_at) {
        let secs = ended.signed_duration_since(started).num_seconds().max(0);
        metrics.insert("duration_secs".into(), secs.into());
    }
    InvestigationFindings { report, metrics }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::{SleepRunner, orchestrator};
    use super::*;
    use crate::domain::{INVESTIGATION_TAG_PREFIX, ProfileInput, RecommendationStatus, RunMode, RunnerKind};

    async fn failed_target(orch: &Orchestrator, root: &std::path::Path) -> anyhow::Result<(Run, String)> {
        let profile = orch
            .create_profile(ProfileInput {
                name: "analyst".into(),
                runner_kind: RunnerKind::Claude,
                model: "sonnet".into(),
                max_turns: 5,
                requires_sandbox: false,
            })
            .await?;
        let task = orch
            .create_task(TaskInput {
                title: "broken".into(),
                project_root: root.to_string_lossy().into_owned(),
                ..Default::default()
            })
            .await?;
        let mut run = Run::new(&task.id, &profile.id, RunMode::InPlace);
        run.status = RunStatus::Failed;
        run.error_message = Some("compile error".into());
        orch.deps().repos.runs.create_run(&run).await?;
        Ok((run, profile.id))
    }

    #[test]
    fn test_prompt_mentions_runs_and_sections() {
        let mut run = Run::new("t", "p", RunMode::InPlace);
        run.status = RunStatus::Failed;
        run.error_message = Some("boom".into());
        let inv = Investigation::new(vec![run.id.clone()], AnalysisFlags::default(), ReportFlags::default());
        let prompt = build_investigation_prompt(&inv, &[run.clone()]);
        assert!(prompt.contains(&run.id));
        assert!(prompt.contains("- error: boom"));
        assert!(prompt.contains("errors and their causes"));
        assert!(prompt.contains("Root cause"));
        assert!(!prompt.contains("Metrics"));
    }

    #[tokio::test]
    async fn test_investigation_lifecycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let orch = orchestrator(SleepRunner::new(Duration::from_millis(10)))?;
        let (target, profile_id) = failed_target(&orch, dir.path()).await?;

        let inv = orch
            .create_investigation(CreateInvestigationRequest {
                run_ids: vec![target.id.clone()],
                profile_id: profile_id.clone(),
                ..Default::default()
            })
            .await?;
        assert_eq!(inv.status, InvestigationStatus::Running);
        let child_id = inv.agent_run_id.clone().expect("child run");

        let child = orch.wait_for_run(&child_id, Duration::from_secs(5)).await?;
        assert_eq!(child.status, RunStatus::Complete);
        assert_eq!(child.mode, RunMode::InPlace);
        assert!(child.effective_tag().starts_with(INVESTIGATION_TAG_PREFIX));
        assert_eq!(child.recommendation.status, RecommendationStatus::Pending);

        let synced = orch.sync_investigation(&inv.id).await?;
        assert_eq!(synced.status, InvestigationStatus::Completed);
        assert_eq!(synced.progress, 100);
        let findings = synced.findings.clone().expect("findings");
        assert!(findings.report.starts_with("finished: You are investigating"));
        assert!(findings.metrics.contains_key("turns"));

        let fix = orch
            .apply_investigation_fixes(&inv.id, vec!["add a test".into(), " ".into()], None)
            .await?;
        assert_eq!(fix.source_investigation_id.as_deref(), Some(inv.id.as_str()));
        let fix_run = orch
            .wait_for_run(fix.agent_run_id.as_deref().expect("fix run"), Duration::from_secs(5))
            .await?;
        assert!(fix_run.effective_tag().starts_with(FIX_TAG_PREFIX));
        assert_eq!(fix_run.recommendation.status, RecommendationStatus::None);

        let err = orch.cancel_investigation(&inv.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        Ok(())
    }

    #[tokio::test]
    async fn test_fixes_need_completed_investigation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let orch = orchestrator(SleepRunner::new(Duration::from_secs(30)))?;
        let (target, profile_id) = failed_target(&orch, dir.path()).await?;
        let inv = orch
            .create_investigation(CreateInvestigationRequest {
                run_ids: vec![target.id],
                profile_id,
                ..Default::default()
            })
            .await?;

        let err = orch
            .apply_investigation_fixes(&inv.id, vec!["x".into()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let cancelled = orch.cancel_investigation(&inv.id).await?;
        assert_eq!(cancelled.status, InvestigationStatus::Cancelled);
        orch.delete_investigation(&inv.id).await?;
        assert!(orch.list_investigations().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() -> anyhow::Result<()> {
        let orch = orchestrator(SleepRunner::new(Duration::ZERO))?;
        let err = orch
            .create_investigation(CreateInvestigationRequest {
                run_ids: vec!["missing".into()],
                profile_id: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }
}
