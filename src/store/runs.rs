//! Run table: lifecycle writes, heartbeats and the recommendation queue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params, params_from_iter};

use super::db::{
    StoreDb, from_json_opt, parse_enum, parse_ts, parse_ts_opt, to_json_opt, ts, ts_opt,
};
use crate::domain::{
    ApprovalState, RecommendationState, RecommendationStatus, Run, RunPhase, RunStatus,
};

const RUN_COLUMNS: &str = "id, task_id, profile_id, idempotency_key, tag, mode, status, phase,
    progress_percent, approval_state, created_at, started_at, ended_at, last_heartbeat, updated_at,
    sandbox_id, work_dir, resolved_config, error_message, summary, exit_code,
    recommendation_status, recommendation_attempts, recommendation_queued_at,
    recommendation_result, recommendation_error";

const TERMINAL_SQL: &str = "('complete', 'failed', 'cancelled')";

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunStatus>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn with_statuses(statuses: &[RunStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }
}

impl StoreDb {
    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
                    RUN_COLUMNS
                ),
                params![
                    run.id,
                    run.task_id,
                    run.profile_id,
                    run.idempotency_key,
                    run.tag,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.phase.as_str(),
                    run.progress_percent,
                    run.approval_state.as_str(),
                    ts(run.created_at),
                    ts_opt(run.started_at),
                    ts_opt(run.ended_at),
                    ts_opt(run.last_heartbeat),
                    ts(run.updated_at),
                    run.sandbox_id,
                    run.work_dir,
                    to_json_opt(run.resolved_config.as_ref())?,
                    run.error_message,
                    to_json_opt(run.summary.as_ref())?,
                    run.exit_code,
                    run.recommendation.status.as_str(),
                    run.recommendation.attempts,
                    ts_opt(run.recommendation.queued_at),
                    to_json_opt(run.recommendation.result.as_ref())?,
                    run.recommendation.error,
                ],
            )
            .context("Failed to insert run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Persist every field of `run` as given.
    ///
    /// A stored terminal status is never replaced by a different one: if
    /// the row is already terminal and `run.status` differs, nothing is
    /// written and `false` is returned.
    pub fn update_run(&self, run: &Run) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE runs SET idempotency_key = ?2, tag = ?3, mode = ?4, status = ?5, phase = ?6,
                     progress_percent = ?7, approval_state = ?8, started_at = ?9, ended_at = ?10,
                     last_heartbeat = ?11, updated_at = ?12, sandbox_id = ?13, work_dir = ?14,
                     resolved_config = ?15, error_message = ?16, summary = ?17, exit_code = ?18,
                     recommendation_status = ?19, recommendation_attempts = ?20,
                     recommendation_queued_at = ?21, recommendation_result = ?22, recommendation_error = ?23
                     WHERE id = ?1 AND (status NOT IN {} OR status = ?5)",
                    TERMINAL_SQL
                ),
                params![
                    run.id,
                    run.idempotency_key,
                    run.tag,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.phase.as_str(),
                    run.progress_percent,
                    run.approval_state.as_str(),
                    ts_opt(run.started_at),
                    ts_opt(run.ended_at),
                    ts_opt(run.last_heartbeat),
                    ts(run.updated_at),
                    run.sandbox_id,
                    run.work_dir,
                    to_json_opt(run.resolved_config.as_ref())?,
                    run.error_message,
                    to_json_opt(run.summary.as_ref())?,
                    run.exit_code,
                    run.recommendation.status.as_str(),
                    run.recommendation.attempts,
                    ts_opt(run.recommendation.queued_at),
                    to_json_opt(run.recommendation.result.as_ref())?,
                    run.recommendation.error,
                ],
            )
            .context("Failed to update run")?;
        Ok(changed > 0)
    }

    /// Move a completed run from review phase `from` to `phase` and record
    /// the approval decision. Only the review columns are written; returns
    /// false when the run is no longer complete in phase `from`.
    pub fn update_run_review(
        &self,
        id: &str,
        from: RunPhase,
        phase: RunPhase,
        approval: ApprovalState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET phase = ?3, progress_percent = ?4, approval_state = ?5, updated_at = ?6
                 WHERE id = ?1 AND phase = ?2 AND status = 'complete'",
                params![
                    id,
                    from.as_str(),
                    phase.as_str(),
                    phase.progress_percent(),
                    approval.as_str(),
                    ts(now),
                ],
            )
            .context("Failed to update run review state")?;
        Ok(changed > 0)
    }

    /// Compare-and-set the status. Succeeds only when the current status is
    /// one of `expected` and not terminal. Entering a terminal status also
    /// stamps `ended_at` and moves the phase to terminal.
    pub fn transition_run_status(
        &self,
        id: &str,
        expected: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expected: Vec<&str> = expected
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        if expected.is_empty() {
            return Ok(false);
        }
        let now = ts(now);
        let to_str = to.as_str();
        let terminal_phase = RunPhase::Terminal.as_str();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&id, &to_str, &error, &now];
        let sql = if to.is_terminal() {
            values.push(&terminal_phase);
            format!(
                "UPDATE runs SET status = ?2, error_message = COALESCE(?3, error_message),
                 updated_at = ?4, ended_at = ?4, phase = ?5
                 WHERE id = ?1 AND status IN ({})",
                placeholders(expected.len(), 6)
            )
        } else {
            format!(
                "UPDATE runs SET status = ?2, error_message = COALESCE(?3, error_message),
                 updated_at = ?4
                 WHERE id = ?1 AND status IN ({})",
                placeholders(expected.len(), 5)
            )
        };
        for status in &expected {
            values.push(status);
        }
        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .context("Failed to transition run status")?;
        Ok(changed > 0)
    }

    /// Reopen a failed or stalled run for resumption at `phase`. This is the
    /// single sanctioned exit from a terminal status and the only write that
    /// moves the phase backwards.
    pub fn reopen_run_for_resume(
        &self,
        id: &str,
        phase: RunPhase,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = ts(now);
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = 'running', phase = ?3, ended_at = NULL, error_message = NULL,
                 last_heartbeat = ?2, updated_at = ?2
                 WHERE id = ?1 AND status IN ('failed', 'running', 'starting')",
                params![id, now, phase.as_str()],
            )
            .context("Failed to reopen run")?;
        Ok(changed > 0)
    }

    /// Write `last_heartbeat` for a live run. Returns false once the run has
    /// left starting/running.
    pub fn touch_run_heartbeat(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET last_heartbeat = ?2 WHERE id = ?1 AND status IN ('starting', 'running')",
                params![id, ts(now)],
            )
            .context("Failed to write heartbeat")?;
        Ok(changed > 0)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut sql = format!("SELECT {} FROM runs", RUN_COLUMNS);
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if !filter.statuses.is_empty() {
            clauses.push(format!(
                "status IN ({})",
                placeholders(filter.statuses.len(), values.len() + 1)
            ));
            values.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(task_id) = &filter.task_id {
            clauses.push(format!("task_id = ?{}", values.len() + 1));
            values.push(task_id.clone());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.query_runs(&sql, values)
    }

    pub fn delete_run(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM runs WHERE id = ?1", params![id])
            .context("Failed to delete run")?;
        Ok(changed > 0)
    }

    pub fn count_runs_for_task(&self, task_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count runs for task")
    }

    pub fn count_runs_for_profile(&self, profile_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE profile_id = ?1",
                params![profile_id],
                |row| row.get(0),
            )
            .context("Failed to count runs for profile")
    }

    /// The non-failed run bound to an idempotency key, if any.
    pub fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM runs WHERE idempotency_key = ?1 AND status != 'failed'",
                    RUN_COLUMNS
                ),
                params![key],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run by idempotency key")?;
        row.map(RunRow::into_run).transpose()
    }

    // ── Recommendation queue ──────────────────────────────────────────

    /// Runs waiting for extraction: pending, or failed with attempts left.
    /// Oldest queued first.
    pub fn list_pending_recommendation_extractions(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs
             WHERE recommendation_status = 'pending'
                OR (recommendation_status = 'failed' AND recommendation_attempts < ?1)
             ORDER BY COALESCE(recommendation_queued_at, updated_at) ASC
             LIMIT {}",
            RUN_COLUMNS, limit
        );
        self.query_runs(&sql, vec![max_retries.to_string()])
    }

    /// Atomically flip a queued extraction to `extracting`. Returns false
    /// if another claimer got there first.
    pub fn claim_recommendation_extraction(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET recommendation_status = 'extracting', updated_at = ?2
                 WHERE id = ?1 AND recommendation_status IN ('pending', 'failed')",
                params![id, ts(now)],
            )
            .context("Failed to claim recommendation extraction")?;
        Ok(changed > 0)
    }

    /// Overwrite the recommendation fields and bump `updated_at`.
    pub fn update_recommendation_state(
        &self,
        id: &str,
        state: &RecommendationState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET recommendation_status = ?2, recommendation_attempts = ?3,
                 recommendation_queued_at = ?4, recommendation_result = ?5,
                 recommendation_error = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    id,
                    state.status.as_str(),
                    state.attempts,
                    ts_opt(state.queued_at),
                    to_json_opt(state.result.as_ref())?,
                    state.error,
                    ts(now),
                ],
            )
            .context("Failed to update recommendation state")?;
        Ok(changed > 0)
    }

    /// Roll extractions stuck in `extracting` since before `cutoff` back to
    /// pending. Returns the recovered run ids.
    pub fn recover_stale_extractions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin stale recovery")?;
        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM runs WHERE recommendation_status = 'extracting' AND updated_at < ?1",
                )
                .context("Failed to prepare stale extraction query")?;
            let rows = stmt
                .query_map(params![ts(cutoff)], |row| row.get(0))
                .context("Failed to list stale extractions")?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for id in &ids {
            tx.execute(
                "UPDATE runs SET recommendation_status = 'pending',
                 recommendation_error = 'recovered from stale extraction', updated_at = ?2
                 WHERE id = ?1 AND recommendation_status = 'extracting'",
                params![id, ts(now)],
            )
            .context("Failed to recover stale extraction")?;
        }
        tx.commit().context("Failed to commit stale recovery")?;
        Ok(ids)
    }

    /// Completed runs whose tag starts with `tag_prefix`, ignoring ASCII
    /// case, and that were never queued for extraction. Newest first. An
    /// empty prefix lists every tagged run.
    pub fn list_unextracted_investigation_runs(
        &self,
        tag_prefix: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs
             WHERE status = 'complete' AND recommendation_status = 'none'
               AND tag IS NOT NULL AND lower(substr(tag, 1, length(?1))) = lower(?1)
             ORDER BY created_at DESC LIMIT {}",
            RUN_COLUMNS, limit
        );
        self.query_runs(&sql, vec![tag_prefix.to_string()])
    }

    fn query_runs(&self, sql: &str, values: Vec<String>) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }
}

fn placeholders(count: usize, start: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Internal row helpers ──────────────────────────────────────────────

struct RunRow {
    id: String,
    task_id: String,
    profile_id: String,
    idempotency_key: Option<String>,
    tag: Option<String>,
    mode: String,
    status: String,
    phase: String,
    progress_percent: u8,
    approval_state: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    last_heartbeat: Option<String>,
    updated_at: String,
    sandbox_id: Option<String>,
    work_dir: Option<String>,
    resolved_config: Option<String>,
    error_message: Option<String>,
    summary: Option<String>,
    exit_code: Option<i32>,
    recommendation_status: String,
    recommendation_attempts: u32,
    recommendation_queued_at: Option<String>,
    recommendation_result: Option<String>,
    recommendation_error: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            profile_id: row.get(2)?,
            idempotency_key: row.get(3)?,
            tag: row.get(4)?,
            mode: row.get(5)?,
            status: row.get(6)?,
            phase: row.get(7)?,
            progress_percent: row.get(8)?,
            approval_state: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            ended_at: row.get(12)?,
            last_heartbeat: row.get(13)?,
            updated_at: row.get(14)?,
            sandbox_id: row.get(15)?,
            work_dir: row.get(16)?,
            resolved_config: row.get(17)?,
            error_message: row.get(18)?,
            summary: row.get(19)?,
            exit_code: row.get(20)?,
            recommendation_status: row.get(21)?,
            recommendation_attempts: row.get(22)?,
            recommendation_queued_at: row.get(23)?,
            recommendation_result: row.get(24)?,
            recommendation_error: row.get(25)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let recommendation = RecommendationState {
            status: parse_enum::<RecommendationStatus>(
                &self.recommendation_status,
                "recommendation status",
            )?,
            attempts: self.recommendation_attempts,
            queued_at: parse_ts_opt(self.recommendation_queued_at)?,
            result: from_json_opt(self.recommendation_result, "recommendation result")?,
            error: self.recommendation_error,
        };
        Ok(Run {
            mode: parse_enum(&self.mode, "run mode")?,
            status: parse_enum(&self.status, "run status")?,
            phase: parse_enum(&self.phase, "run phase")?,
            approval_state: parse_enum(&self.approval_state, "approval state")?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_ts_opt(self.started_at)?,
            ended_at: parse_ts_opt(self.ended_at)?,
            last_heartbeat: parse_ts_opt(self.last_heartbeat)?,
            updated_at: parse_ts(&self.updated_at)?,
            resolved_config: from_json_opt(self.resolved_config, "resolved config")?,
            summary: from_json_opt(self.summary, "run summary")?,
            id: self.id,
            task_id: self.task_id,
            profile_id: self.profile_id,
            idempotency_key: self.idempotency_key,
            tag: self.tag,
            progress_percent: self.progress_percent,
            sandbox_id: self.sandbox_id,
            work_dir: self.work_dir,
            error_message: self.error_message,
            exit_code: self.exit_code,
            recommendation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunMode, RunSummary};
    use crate::store::testing::seed_run;

    #[test]
    fn test_insert_and_get_run_preserves_fields() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::Sandboxed)?;
        run.summary = Some(RunSummary {
            description: "did things".into(),
            ..Default::default()
        });
        run.tag = Some("ecosystem-1".into());
        assert!(db.update_run(&run)?);

        let fetched = db.get_run(&run.id)?.context("run missing")?;
        assert_eq!(fetched.mode, RunMode::Sandboxed);
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.summary.unwrap().description, "did things");
        assert_eq!(fetched.tag.as_deref(), Some("ecosystem-1"));
        Ok(())
    }

    #[test]
    fn test_terminal_status_is_never_reverted() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        run.status = RunStatus::Complete;
        assert!(db.update_run(&run)?);

        run.status = RunStatus::Running;
        assert!(!db.update_run(&run)?);
        assert_eq!(db.get_run(&run.id)?.unwrap().status, RunStatus::Complete);

        // Other fields of a terminal run may still change.
        run.status = RunStatus::Complete;
        run.progress_percent = 100;
        assert!(db.update_run(&run)?);

        let moved = db.transition_run_status(
            &run.id,
            &[RunStatus::Running, RunStatus::Complete],
            RunStatus::Failed,
            Some("late"),
            Utc::now(),
        )?;
        assert!(!moved);
        Ok(())
    }

    #[test]
    fn test_review_update_leaves_other_columns_alone() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::Sandboxed)?;
        run.status = RunStatus::Complete;
        run.phase = RunPhase::AwaitingReview;
        run.sandbox_id = Some("sb-1".into());
        run.recommendation.status = RecommendationStatus::Pending;
        run.recommendation.attempts = 1;
        assert!(db.update_run(&run)?);

        assert!(db.update_run_review(
            &run.id,
            RunPhase::AwaitingReview,
            RunPhase::Applying,
            ApprovalState::Pending,
            Utc::now(),
        )?);
        // A second writer still expecting awaiting_review loses.
        assert!(!db.update_run_review(
            &run.id,
            RunPhase::AwaitingReview,
            RunPhase::Terminal,
            ApprovalState::Rejected,
            Utc::now(),
        )?);
        assert!(db.update_run_review(
            &run.id,
            RunPhase::Applying,
            RunPhase::Terminal,
            ApprovalState::Approved,
            Utc::now(),
        )?);

        let fetched = db.get_run(&run.id)?.context("run missing")?;
        assert_eq!(fetched.phase, RunPhase::Terminal);
        assert_eq!(fetched.progress_percent, 100);
        assert_eq!(fetched.approval_state, ApprovalState::Approved);
        assert_eq!(fetched.status, RunStatus::Complete);
        assert_eq!(fetched.sandbox_id.as_deref(), Some("sb-1"));
        assert_eq!(fetched.recommendation.status, RecommendationStatus::Pending);
        assert_eq!(fetched.recommendation.attempts, 1);
        Ok(())
    }

    #[test]
    fn test_transition_to_terminal_sets_end_time() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        run.status = RunStatus::Running;
        db.update_run(&run)?;

        assert!(db.transition_run_status(
            &run.id,
            &[RunStatus::Running, RunStatus::Starting],
            RunStatus::Failed,
            Some("process terminated unexpectedly"),
            Utc::now(),
        )?);
        let fetched = db.get_run(&run.id)?.unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
        assert_eq!(fetched.phase, RunPhase::Terminal);
        assert!(fetched.ended_at.is_some());
        assert_eq!(
            fetched.error_message.as_deref(),
            Some("process terminated unexpectedly")
        );
        Ok(())
    }

    #[test]
    fn test_heartbeat_only_for_live_runs() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        assert!(!db.touch_run_heartbeat(&run.id, Utc::now())?);

        run.status = RunStatus::Running;
        db.update_run(&run)?;
        assert!(db.touch_run_heartbeat(&run.id, Utc::now())?);
        assert!(db.get_run(&run.id)?.unwrap().last_heartbeat.is_some());
        Ok(())
    }

    #[test]
    fn test_reopen_failed_run() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        run.status = RunStatus::Failed;
        run.error_message = Some("boom".into());
        db.update_run(&run)?;

        assert!(db.reopen_run_for_resume(&run.id, RunPhase::Executing, Utc::now())?);
        let fetched = db.get_run(&run.id)?.unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
        assert_eq!(fetched.phase, RunPhase::Executing);
        assert!(fetched.error_message.is_none());

        let mut done = seed_run(&db, RunMode::InPlace)?;
        done.status = RunStatus::Complete;
        db.update_run(&done)?;
        assert!(!db.reopen_run_for_resume(&done.id, RunPhase::Executing, Utc::now())?);
        Ok(())
    }

    #[test]
    fn test_idempotency_key_unique_among_non_failed_runs() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut first = seed_run(&db, RunMode::InPlace)?;
        first.idempotency_key = Some("k1".into());
        db.update_run(&first)?;

        let mut second = Run::new(&first.task_id, &first.profile_id, RunMode::InPlace);
        second.idempotency_key = Some("k1".into());
        assert!(db.insert_run(&second).is_err());

        first.status = RunStatus::Failed;
        db.update_run(&first)?;
        db.insert_run(&second)?;
        assert_eq!(db.find_run_by_idempotency_key("k1")?.unwrap().id, second.id);
        Ok(())
    }

    #[test]
    fn test_list_runs_by_status() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut a = seed_run(&db, RunMode::InPlace)?;
        a.status = RunStatus::Running;
        db.update_run(&a)?;
        let _b = seed_run(&db, RunMode::InPlace)?;

        let running = db.list_runs(&RunFilter::with_statuses(&[RunStatus::Running]))?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
        assert_eq!(db.list_runs(&RunFilter::default())?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_claim_is_compare_and_set() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        run.status = RunStatus::Complete;
        run.recommendation.status = RecommendationStatus::Pending;
        db.update_run(&run)?;

        assert!(db.claim_recommendation_extraction(&run.id, Utc::now())?);
        assert!(!db.claim_recommendation_extraction(&run.id, Utc::now())?);
        assert_eq!(
            db.get_run(&run.id)?.unwrap().recommendation.status,
            RecommendationStatus::Extracting
        );
        Ok(())
    }

    #[test]
    fn test_pending_listing_includes_failed_with_attempts_left() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut exhausted = seed_run(&db, RunMode::InPlace)?;
        exhausted.recommendation.status = RecommendationStatus::Failed;
        exhausted.recommendation.attempts = 3;
        db.update_run(&exhausted)?;

        let mut retryable = seed_run(&db, RunMode::InPlace)?;
        retryable.recommendation.status = RecommendationStatus::Failed;
        retryable.recommendation.attempts = 1;
        db.update_run(&retryable)?;

        let pending = db.list_pending_recommendation_extractions(3, 10)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, retryable.id);
        Ok(())
    }

    #[test]
    fn test_recover_stale_extractions() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut run = seed_run(&db, RunMode::InPlace)?;
        run.recommendation.status = RecommendationStatus::Extracting;
        run.updated_at = Utc::now() - chrono::Duration::minutes(1);
        db.update_run(&run)?;

        let now = Utc::now();
        let recovered =
            db.recover_stale_extractions(now - chrono::Duration::milliseconds(10), now)?;
        assert_eq!(recovered, vec![run.id.clone()]);
        let fetched = db.get_run(&run.id)?.unwrap();
        assert_eq!(fetched.recommendation.status, RecommendationStatus::Pending);
        assert!(fetched.recommendation.error.unwrap().contains("recovered"));
        Ok(())
    }

    #[test]
    fn test_list_unextracted_investigation_runs() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut inv = seed_run(&db, RunMode::InPlace)?;
        inv.status = RunStatus::Complete;
        inv.tag = Some("agent-manager-investigation-abc".into());
        db.update_run(&inv)?;

        let mut other = seed_run(&db, RunMode::InPlace)?;
        other.status = RunStatus::Complete;
        other.tag = Some("ecosystem-1".into());
        db.update_run(&other)?;

        let found = db.list_unextracted_investigation_runs("agent-manager-investigation", 100)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, inv.id);

        let found = db.list_unextracted_investigation_runs("Ecosystem", 100)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, other.id);
        assert_eq!(db.list_unextracted_investigation_runs("", 100)?.len(), 2);
        Ok(())
    }
}
