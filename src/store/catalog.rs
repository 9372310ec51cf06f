//! Profile and task tables.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::db::{StoreDb, parse_enum, parse_ts, ts};
use crate::domain::{AgentProfile, Task, TaskStatus};

const PROFILE_COLUMNS: &str =
    "id, name, runner_kind, model, max_turns, requires_sandbox, created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, title, description, scope_path, project_root, status, created_at, updated_at";

impl StoreDb {
    // ── Profile CRUD ──────────────────────────────────────────────────

    pub fn insert_profile(&self, profile: &AgentProfile) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO profiles (id, name, runner_kind, model, max_turns, requires_sandbox, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    profile.id,
                    profile.name,
                    profile.runner_kind.as_str(),
                    profile.model,
                    profile.max_turns,
                    profile.requires_sandbox,
                    ts(profile.created_at),
                    ts(profile.updated_at),
                ],
            )
            .context("Failed to insert profile")?;
        Ok(())
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<AgentProfile>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
                params![id],
                ProfileRow::from_row,
            )
            .optional()
            .context("Failed to query profile")?;
        row.map(ProfileRow::into_profile).transpose()
    }

    pub fn update_profile(&self, profile: &AgentProfile) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE profiles SET name = ?2, runner_kind = ?3, model = ?4, max_turns = ?5,
                 requires_sandbox = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    profile.id,
                    profile.name,
                    profile.runner_kind.as_str(),
                    profile.model,
                    profile.max_turns,
                    profile.requires_sandbox,
                    ts(profile.updated_at),
                ],
            )
            .context("Failed to update profile")?;
        Ok(changed > 0)
    }

    pub fn delete_profile(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM profiles WHERE id = ?1", params![id])
            .context("Failed to delete profile")?;
        Ok(changed > 0)
    }

    pub fn list_profiles(&self) -> Result<Vec<AgentProfile>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM profiles ORDER BY created_at",
                PROFILE_COLUMNS
            ))
            .context("Failed to prepare list_profiles")?;
        let rows = stmt
            .query_map([], ProfileRow::from_row)
            .context("Failed to list profiles")?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?.into_profile()?);
        }
        Ok(profiles)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tasks (id, title, description, scope_path, project_root, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.scope_path,
                    task.project_root,
                    task.status.as_str(),
                    ts(task.created_at),
                    ts(task.updated_at),
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn update_task(&self, task: &Task) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET title = ?2, description = ?3, scope_path = ?4, project_root = ?5,
                 status = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.scope_path,
                    task.project_root,
                    task.status.as_str(),
                    ts(task.updated_at),
                ],
            )
            .context("Failed to update task")?;
        Ok(changed > 0)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts(chrono::Utc::now())],
            )
            .context("Failed to update task status")?;
        Ok(changed > 0)
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(changed > 0)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM tasks ORDER BY created_at", TASK_COLUMNS))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map([], TaskRow::from_row)
            .context("Failed to list tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct ProfileRow {
    id: String,
    name: String,
    runner_kind: String,
    model: String,
    max_turns: u32,
    requires_sandbox: bool,
    created_at: String,
    updated_at: String,
}

impl ProfileRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            runner_kind: row.get(2)?,
            model: row.get(3)?,
            max_turns: row.get(4)?,
            requires_sandbox: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_profile(self) -> Result<AgentProfile> {
        Ok(AgentProfile {
            runner_kind: parse_enum(&self.runner_kind, "profile runner kind")?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            model: self.model,
            max_turns: self.max_turns,
            requires_sandbox: self.requires_sandbox,
        })
    }
}

struct TaskRow {
    id: String,
    title: String,
    description: String,
    scope_path: String,
    project_root: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            scope_path: row.get(3)?,
            project_root: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            status: parse_enum(&self.status, "task status")?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            title: self.title,
            description: self.description,
            scope_path: self.scope_path,
            project_root: self.project_root,
        })
    }
}
