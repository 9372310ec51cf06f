//! Profile and task CRUD.

use chrono::Utc;

use super::{Orchestrator, Result};
use crate::domain::{AgentProfile, ProfileInput, Task, TaskInput, TaskStatus};
use crate::errors::OrchestratorError;

impl Orchestrator {
    // ── Profiles ──────────────────────────────────────────────────────

    pub async fn create_profile(&self, input: ProfileInput) -> Result<AgentProfile> {
        validate_profile(&input)?;
        let now = Utc::now();
        let profile = AgentProfile {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            runner_kind: input.runner_kind,
            model: input.model,
            max_turns: input.max_turns,
            requires_sandbox: input.requires_sandbox,
            created_at: now,
            updated_at: now,
        };
        self.deps
            .repos
            .profiles
            .create_profile(&profile)
            .await
            .map_err(OrchestratorError::Database)?;
        tracing::info!(profile_id = %profile.id, name = %profile.name, "Profile created");
        Ok(profile)
    }

    pub async fn get_profile(&self, id: &str) -> Result<AgentProfile> {
        self.deps
            .repos
            .profiles
            .get_profile(id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("profile", id))
    }

    pub async fn list_profiles(&self) -> Result<Vec<AgentProfile>> {
        self.deps
            .repos
            .profiles
            .list_profiles()
            .await
            .map_err(OrchestratorError::Database)
    }

    /// Profiles are frozen while a live run references them.
    pub async fn update_profile(&self, id: &str, input: ProfileInput) -> Result<AgentProfile> {
        validate_profile(&input)?;
        let mut profile = self.get_profile(id).await?;
        let live = self
            .deps
            .repos
            .runs
            .list_runs(crate::store::RunFilter::with_statuses(&[
                crate::domain::RunStatus::Pending,
                crate::domain::RunStatus::Starting,
                crate::domain::RunStatus::Running,
            ]))
            .await
            .map_err(OrchestratorError::Database)?;
        if live.iter().any(|run| run.profile_id == id) {
            return Err(OrchestratorError::Conflict(format!(
                "profile {} is in use by a live run",
                id
            )));
        }

        profile.name = input.name.trim().to_string();
        profile.runner_kind = input.runner_kind;
        profile.model = input.model;
        profile.max_turns = input.max_turns;
        profile.requires_sandbox = input.requires_sandbox;
        profile.updated_at = Utc::now();
        self.deps
            .repos
            .profiles
            .update_profile(&profile)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(profile)
    }

    pub async fn delete_profile(&self, id: &str) -> Result<()> {
        self.get_profile(id).await?;
        let referenced = self
            .deps
            .repos
            .runs
            .count_runs_for_profile(id)
            .await
            .map_err(OrchestratorError::Database)?;
        if referenced > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "profile {} is referenced by {} run(s)",
                id, referenced
            )));
        }
        self.deps
            .repos
            .profiles
            .delete_profile(id)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn create_task(&self, input: TaskInput) -> Result<Task> {
        let input = self.normalize_task(input)?;
        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: input.title,
            description: input.description,
            scope_path: input.scope_path,
            project_root: input.project_root,
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
        };
        self.deps
            .repos
            .tasks
            .create_task(&task)
            .await
            .map_err(OrchestratorError::Database)?;
        tracing::info!(task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.deps
            .repos
            .tasks
            .get_task(id)
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::not_found("task", id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.deps
            .repos
            .tasks
            .list_tasks()
            .await
            .map_err(OrchestratorError::Database)
    }

    /// Replace the editable fields. Status is owned by the executor.
    pub async fn update_task(&self, id: &str, input: TaskInput) -> Result<Task> {
        let input = self.normalize_task(input)?;
        let mut task = self.get_task(id).await?;
        task.title = input.title;
        task.description = input.description;
        task.scope_path = input.scope_path;
        task.project_root = input.project_root;
        task.updated_at = Utc::now();
        self.deps
            .repos
            .tasks
            .update_task(&task)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.get_task(id).await?;
        let referenced = self
            .deps
            .repos
            .runs
            .count_runs_for_task(id)
            .await
            .map_err(OrchestratorError::Database)?;
        if referenced > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "task {} is referenced by {} run(s)",
                id, referenced
            )));
        }
        self.deps
            .repos
            .tasks
            .delete_task(id)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    fn normalize_task(&self, mut input: TaskInput) -> Result<TaskInput> {
        input.title = input.title.trim().to_string();
        if input.title.is_empty() {
            return Err(OrchestratorError::Validation(
                "task title must not be empty".to_string(),
            ));
        }
        if input.description.trim().is_empty() {
            input.description = input.title.clone();
        }
        if input.scope_path.trim().is_empty() {
            input.scope_path = ".".to_string();
        }
        if input.project_root.trim().is_empty() {
            input.project_root = match &self.config.default_project_root {
                Some(root) => root.to_string_lossy().into_owned(),
                None => {
                    return Err(OrchestratorError::Validation(
                        "task project root is required".to_string(),
                    ));
                }
            };
        }
        Ok(input)
    }
}

fn validate_profile(input: &ProfileInput) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "profile name must not be empty".to_string(),
        ));
    }
    if input.model.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "profile model must not be empty".to_string(),
        ));
    }
    if input.max_turns == 0 {
        return Err(OrchestratorError::Validation(
            "profile max_turns must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::{SleepRunner, orchestrator};
    use super::super::CreateRunRequest;
    use super::*;
    use crate::domain::RunnerKind;
    use crate::errors::ErrorKind;

    fn profile_input(name: &str) -> ProfileInput {
        ProfileInput {
            name: name.into(),
            runner_kind: RunnerKind::Claude,
            model: "sonnet".into(),
            max_turns: 5,
            requires_sandbox: false,
        }
    }

    #[tokio::test]
    async fn test_profile_crud() -> anyhow::Result<()> {
        let orch = orchestrator(SleepRunner::new(Duration::ZERO))?;
        let created = orch.create_profile(profile_input("  reviewer ")).await?;
        assert_eq!(created.name, "reviewer");

        let mut input = profile_input("reviewer");
        input.max_turns = 50;
        let updated = orch.update_profile(&created.id, input).await?;
        assert_eq!(updated.max_turns, 50);
        assert_eq!(orch.get_profile(&created.id).await?.max_turns, 50);
        assert_eq!(orch.list_profiles().await?.len(), 1);

        orch.delete_profile(&created.id).await?;
        let err = orch.get_profile(&created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_profile_validation() -> anyhow::Result<()> {
        let orch = orchestrator(SleepRunner::new(Duration::ZERO))?;
        let err = orch.create_profile(profile_input(" ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut zero = profile_input("p");
        zero.max_turns = 0;
        let err = orch.create_profile(zero).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_defaults_and_validation() -> anyhow::Result<()> {
        let orch = orchestrator(SleepRunner::new(Duration::ZERO))?;
        let err = orch
            .create_task(TaskInput {
                title: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let task = orch
            .create_task(TaskInput {
                title: "t".into(),
                project_root: "/srv/project".into(),
                ..Default::default()
            })
            .await?;
        assert_eq!(task.scope_path, ".");
        assert_eq!(task.description, "t");
        assert_eq!(task.status, TaskStatus::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn test_referenced_task_cannot_be_deleted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let orch = orchestrator(SleepRunner::new(Duration::ZERO))?;
        let profile = orch.create_profile(profile_input("p")).await?;
        let task = orch
            .create_task(TaskInput {
                title: "t".into(),
                project_root: dir.path().to_string_lossy().into_owned(),
                ..Default::default()
            })
            .await?;
        let run = orch
            .create_run(CreateRunRequest::new(&task.id, &profile.id))
            .await?;
        orch.wait_for_run(&run.id, Duration::from_secs(5)).await?;

        let err = orch.delete_task(&task.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = orch.delete_profile(&profile.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        Ok(())
    }
}
