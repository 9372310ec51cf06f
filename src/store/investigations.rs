use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::db::{StoreDb, from_json_opt, parse_enum, parse_ts, to_json, to_json_opt, ts};
use crate::domain::Investigation;

const INVESTIGATION_COLUMNS: &str = "id, run_ids, status, progress, analysis, report, agent_run_id,
    findings, source_investigation_id, error_message, created_at, updated_at";

impl StoreDb {
    pub fn insert_investigation(&self, inv: &Investigation) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO investigations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    INVESTIGATION_COLUMNS
                ),
                params![
                    inv.id,
                    to_json(&inv.run_ids)?,
                    inv.status.as_str(),
                    inv.progress,
                    to_json(&inv.analysis)?,
                    to_json(&inv.report)?,
                    inv.agent_run_id,
                    to_json_opt(inv.findings.as_ref())?,
                    inv.source_investigation_id,
                    inv.error_message,
                    ts(inv.created_at),
                    ts(inv.updated_at),
                ],
            )
            .context("Failed to insert investigation")?;
        Ok(())
    }

    pub fn update_investigation(&self, inv: &Investigation) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE investigations SET run_ids = ?2, status = ?3, progress = ?4, analysis = ?5,
                 report = ?6, agent_run_id = ?7, findings = ?8, source_investigation_id = ?9,
                 error_message = ?10, updated_at = ?11 WHERE id = ?1",
                params![
                    inv.id,
                    to_json(&inv.run_ids)?,
                    inv.status.as_str(),
                    inv.progress,
                    to_json(&inv.analysis)?,
                    to_json(&inv.report)?,
                    inv.agent_run_id,
                    to_json_opt(inv.findings.as_ref())?,
                    inv.source_investigation_id,
                    inv.error_message,
                    ts(inv.updated_at),
                ],
            )
            .context("Failed to update investigation")?;
        Ok(changed > 0)
    }

    pub fn get_investigation(&self, id: &str) -> Result<Option<Investigation>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM investigations WHERE id = ?1", INVESTIGATION_COLUMNS),
                params![id],
                InvestigationRow::from_row,
            )
            .optional()
            .context("Failed to query investigation")?;
        row.map(InvestigationRow::into_investigation).transpose()
    }

    pub fn list_investigations(&self) -> Result<Vec<Investigation>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM investigations ORDER BY created_at DESC",
                INVESTIGATION_COLUMNS
            ))
            .context("Failed to prepare list_investigations")?;
        let rows = stmt
            .query_map([], InvestigationRow::from_row)
            .context("Failed to list investigations")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_investigation()?);
        }
        Ok(out)
    }

    pub fn delete_investigation(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM investigations WHERE id = ?1", params![id])
            .context("Failed to delete investigation")?;
        Ok(changed > 0)
    }
}

struct InvestigationRow {
    id: String,
    run_ids: String,
    status: String,
    progress: u8,
    analysis: String,
    report: String,
    agent_run_id: Option<String>,
    findings: Option<String>,
    source_investigation_id: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InvestigationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_ids: row.get(1)?,
            status: row.get(2)?,
            progress: row.get(3)?,
            analysis: row.get(4)?,
            report: row.get(5)?,
            agent_run_id: row.get(6)?,
            findings: row.get(7)?,
            source_investigation_id: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_investigation(self) -> Result<Investigation> {
        Ok(Investigation {
            run_ids: serde_json::from_str(&self.run_ids).context("Failed to parse run_ids JSON")?,
            status: parse_enum(&self.status, "investigation status")?,
            analysis: serde_json::from_str(&self.analysis).context("Failed to parse analysis JSON")?,
            report: serde_json::from_str(&self.report).context("Failed to parse report JSON")?,
            findings: from_json_opt(self.findings, "findings")?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            progress: self.progress,
            agent_run_id: self.agent_run_id,
            source_investigation_id: self.source_investigation_id,
            error_message: self.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnalysisFlags, InvestigationFindings, InvestigationStatus, ReportFlags};

    #[test]
    fn test_investigation_crud() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let mut inv = Investigation::new(
            vec!["r1".into(), "r2".into()],
            AnalysisFlags::default(),
            ReportFlags::default(),
        );
        db.insert_investigation(&inv)?;

        inv.status = InvestigationStatus::Completed;
        inv.progress = 100;
        inv.findings = Some(InvestigationFindings {
            report: "root cause: flaky network".into(),
            ..Default::default()
        });
        assert!(db.update_investigation(&inv)?);

        let fetched = db.get_investigation(&inv.id)?.context("missing")?;
        assert_eq!(fetched.run_ids, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(fetched.status, InvestigationStatus::Completed);
        assert!(fetched.findings.unwrap().report.contains("flaky"));

        assert_eq!(db.list_investigations()?.len(), 1);
        assert!(db.delete_investigation(&inv.id)?);
        Ok(())
    }
}
