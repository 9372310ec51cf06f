use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};

use super::db::{StoreDb, parse_ts, ts};
use crate::domain::{EventPayload, EventType, RunEvent};

/// Options for reading a run's events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events with a sequence strictly greater than this.
    pub after_sequence: Option<i64>,
    /// Empty means all types.
    pub event_types: Vec<EventType>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn matches(&self, event: &RunEvent) -> bool {
        if let Some(after) = self.after_sequence
            && event.sequence <= after
        {
            return false;
        }
        self.event_types.is_empty() || self.event_types.contains(&event.payload.event_type())
    }
}

impl StoreDb {
    /// Append payloads in order, assigning consecutive sequence numbers.
    pub fn append_events(
        &self,
        run_id: &str,
        payloads: &[EventPayload],
        now: DateTime<Utc>,
    ) -> Result<Vec<RunEvent>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin event append")?;
        let last: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM run_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to read last event sequence")?;

        let mut events = Vec::with_capacity(payloads.len());
        for (offset, payload) in payloads.iter().enumerate() {
            let sequence = last + offset as i64 + 1;
            tx.execute(
                "INSERT INTO run_events (run_id, sequence, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    sequence,
                    payload.event_type().as_str(),
                    serde_json::to_string(payload).context("Failed to serialize event")?,
                    ts(now),
                ],
            )
            .context("Failed to insert event")?;
            events.push(RunEvent {
                run_id: run_id.to_string(),
                sequence,
                timestamp: now,
                payload: payload.clone(),
            });
        }
        tx.commit().context("Failed to commit events")?;
        Ok(events)
    }

    pub fn get_events(&self, run_id: &str, query: &EventQuery) -> Result<Vec<RunEvent>> {
        let mut sql = String::from(
            "SELECT run_id, sequence, payload, created_at FROM run_events WHERE run_id = ?1 AND sequence > ?2",
        );
        let mut values: Vec<String> = vec![
            run_id.to_string(),
            query.after_sequence.unwrap_or(0).to_string(),
        ];
        if !query.event_types.is_empty() {
            let placeholders: Vec<String> = (0..query.event_types.len())
                .map(|i| format!("?{}", i + 3))
                .collect();
            sql.push_str(&format!(" AND event_type IN ({})", placeholders.join(", ")));
            values.extend(query.event_types.iter().map(|t| t.as_str().to_string()));
        }
        sql.push_str(" ORDER BY sequence ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query events")?;

        let mut events = Vec::new();
        for row in rows {
            let (run_id, sequence, payload, created_at) = row?;
            events.push(RunEvent {
                run_id,
                sequence,
                timestamp: parse_ts(&created_at)?,
                payload: serde_json::from_str(&payload).context("Failed to parse event payload")?,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageRole, RunMode};
    use crate::store::testing::seed_run;

    #[test]
    fn test_append_assigns_increasing_sequences() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let run = seed_run(&db, RunMode::InPlace)?;
        db.append_events(&run.id, &[EventPayload::system("start")], Utc::now())?;
        let appended = db.append_events(
            &run.id,
            &[
                EventPayload::assistant("thinking"),
                EventPayload::ToolCall {
                    name: "Read".into(),
                    input: serde_json::json!({"path": "a.rs"}),
                },
            ],
            Utc::now(),
        )?;
        assert_eq!(appended[0].sequence, 2);
        assert_eq!(appended[1].sequence, 3);

        let all = db.get_events(&run.id, &EventQuery::default())?;
        let seqs: Vec<i64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_query_filters() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let run = seed_run(&db, RunMode::InPlace)?;
        db.append_events(
            &run.id,
            &[
                EventPayload::system("start"),
                EventPayload::assistant("one"),
                EventPayload::Error {
                    code: "E1".into(),
                    message: "bad".into(),
                },
                EventPayload::assistant("two"),
            ],
            Utc::now(),
        )?;

        let messages = db.get_events(
            &run.id,
            &EventQuery {
                event_types: vec![EventType::Message],
                after_sequence: Some(1),
                limit: Some(1),
            },
        )?;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].payload,
            EventPayload::Message {
                role: MessageRole::Assistant,
                content: "one".into()
            }
        );
        Ok(())
    }

    #[test]
    fn test_query_matches_in_memory() {
        let event = RunEvent {
            run_id: "r".into(),
            sequence: 5,
            timestamp: Utc::now(),
            payload: EventPayload::system("x"),
        };
        assert!(EventQuery::default().matches(&event));
        assert!(!EventQuery {
            after_sequence: Some(5),
            ..Default::default()
        }
        .matches(&event));
        assert!(!EventQuery {
            event_types: vec![EventType::Error],
            ..Default::default()
        }
        .matches(&event));
    }
}
