use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::db::{StoreDb, parse_enum, parse_ts, ts};
use crate::domain::RunCheckpoint;

impl StoreDb {
    /// Upsert: only the latest checkpoint per run is kept.
    pub fn save_checkpoint(&self, cp: &RunCheckpoint) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_checkpoints (run_id, phase, sandbox_id, work_dir, lock_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET phase = excluded.phase,
                     sandbox_id = excluded.sandbox_id, work_dir = excluded.work_dir,
                     lock_id = excluded.lock_id, created_at = excluded.created_at",
                params![
                    cp.run_id,
                    cp.phase.as_str(),
                    cp.sandbox_id,
                    cp.work_dir,
                    cp.lock_id,
                    ts(cp.created_at),
                ],
            )
            .context("Failed to save checkpoint")?;
        Ok(())
    }

    pub fn get_checkpoint(&self, run_id: &str) -> Result<Option<RunCheckpoint>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, phase, sandbox_id, work_dir, lock_id, created_at
                 FROM run_checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query checkpoint")?;
        let Some((run_id, phase, sandbox_id, work_dir, lock_id, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(RunCheckpoint {
            run_id,
            phase: parse_enum(&phase, "checkpoint phase")?,
            sandbox_id,
            work_dir,
            lock_id,
            created_at: parse_ts(&created_at)?,
        }))
    }

    pub fn delete_checkpoint(&self, run_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM run_checkpoints WHERE run_id = ?1", params![run_id])
            .context("Failed to delete checkpoint")?;
        Ok(changed > 0)
    }
}
