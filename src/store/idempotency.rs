use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::db::{StoreDb, from_json_opt, parse_enum, parse_ts, to_json_opt, ts};
use crate::domain::{IdempotencyRecord, IdempotencyStatus};

impl StoreDb {
    /// Live reservation for `key`; expired records read as absent.
    pub fn check_idempotency(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .get_idempotency_record(key)?
            .filter(|record| !record.is_expired(now)))
    }

    /// Reserve `key` as pending. Fails (returns false) if a live pending or
    /// complete reservation exists; failed or expired records are replaced.
    pub fn reserve_idempotency(
        &self,
        key: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin reservation")?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT status, expires_at FROM idempotency_keys WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read reservation")?;

        if let Some((status, expires_at)) = existing {
            let status: IdempotencyStatus = parse_enum(&status, "idempotency status")?;
            let expired = now >= parse_ts(&expires_at)?;
            if !expired && status != IdempotencyStatus::Failed {
                return Ok(false);
            }
            tx.execute("DELETE FROM idempotency_keys WHERE key = ?1", params![key])
                .context("Failed to replace reservation")?;
        }

        tx.execute(
            "INSERT INTO idempotency_keys (key, status, created_at, expires_at)
             VALUES (?1, 'pending', ?2, ?3)",
            params![key, ts(now), ts(now + ttl)],
        )
        .context("Failed to insert reservation")?;
        tx.commit().context("Failed to commit reservation")?;
        Ok(true)
    }

    pub fn complete_idempotency(
        &self,
        key: &str,
        entity_id: &str,
        entity_type: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE idempotency_keys SET status = 'complete', entity_id = ?2, entity_type = ?3, metadata = ?4
                 WHERE key = ?1",
                params![key, entity_id, entity_type, to_json_opt(metadata)?],
            )
            .context("Failed to complete reservation")?;
        Ok(changed > 0)
    }

    pub fn fail_idempotency(&self, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE idempotency_keys SET status = 'failed' WHERE key = ?1",
                params![key],
            )
            .context("Failed to mark reservation failed")?;
        Ok(changed > 0)
    }

    pub fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                params![ts(now)],
            )
            .context("Failed to purge expired reservations")
    }

    fn get_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, status, entity_id, entity_type, metadata, created_at, expires_at
                 FROM idempotency_keys WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query reservation")?;
        let Some((key, status, entity_id, entity_type, metadata, created_at, expires_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(IdempotencyRecord {
            key,
            status: parse_enum(&status, "idempotency status")?,
            entity_id,
            entity_type,
            metadata: from_json_opt(metadata, "idempotency metadata")?,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour() -> chrono::Duration {
        chrono::Duration::hours(1)
    }

    #[test]
    fn test_reserve_then_conflict() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let now = Utc::now();
        assert!(db.reserve_idempotency("k1", hour(), now)?);
        assert!(!db.reserve_idempotency("k1", hour(), now)?);

        let record = db.check_idempotency("k1", now)?.context("missing")?;
        assert_eq!(record.status, IdempotencyStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_complete_binds_entity() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let now = Utc::now();
        db.reserve_idempotency("k1", hour(), now)?;
        db.complete_idempotency("k1", "run-1", "run", Some(&serde_json::json!({"mode": "in_place"})))?;

        let record = db.check_idempotency("k1", now)?.unwrap();
        assert_eq!(record.status, IdempotencyStatus::Complete);
        assert_eq!(record.entity_id.as_deref(), Some("run-1"));
        assert_eq!(record.metadata.unwrap()["mode"], "in_place");
        // A complete reservation cannot be re-reserved while live.
        assert!(!db.reserve_idempotency("k1", hour(), now)?);
        Ok(())
    }

    #[test]
    fn test_failed_reservation_can_be_retried() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let now = Utc::now();
        db.reserve_idempotency("k1", hour(), now)?;
        db.fail_idempotency("k1")?;
        assert!(db.reserve_idempotency("k1", hour(), now)?);
        Ok(())
    }

    #[test]
    fn test_expired_reservation_is_replaced() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let now = Utc::now();
        db.reserve_idempotency("k1", chrono::Duration::seconds(1), now)?;

        let later = now + chrono::Duration::seconds(2);
        assert!(db.check_idempotency("k1", later)?.is_none());
        assert!(db.reserve_idempotency("k1", hour(), later)?);
        Ok(())
    }

    #[test]
    fn test_purge_expired() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let now = Utc::now();
        db.reserve_idempotency("old", chrono::Duration::seconds(1), now)?;
        db.reserve_idempotency("new", hour(), now)?;
        let purged = db.purge_expired_idempotency(now + chrono::Duration::seconds(5))?;
        assert_eq!(purged, 1);
        Ok(())
    }
}
