//! Source text for recommendation extraction.

use anyhow::Result;

use crate::domain::{EventPayload, EventType, MessageRole, Run};
use crate::store::{EventQuery, EventStore};

/// Assistant messages considered when a run has no summary.
pub const MAX_MESSAGE_EVENTS: usize = 100;

pub const SOURCE_SUMMARY: &str = "summary";
pub const SOURCE_EVENTS: &str = "events";

/// Text to extract from, and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceText {
    pub text: String,
    pub source: &'static str,
}

/// Prefer the run summary; otherwise join the assistant messages in order.
/// Returns `None` when there is nothing to read.
pub async fn gather(run: &Run, events: &dyn EventStore, max_len: usize) -> Result<Option<SourceText>> {
    if let Some(summary) = &run.summary
        && !summary.description.trim().is_empty()
    {
        return Ok(Some(SourceText {
            text: truncate_chars(&summary.description, max_len),
            source: SOURCE_SUMMARY,
        }));
    }

    let query = EventQuery {
        event_types: vec![EventType::Message],
        ..Default::default()
    };
    let messages: Vec<String> = events
        .get_events(&run.id, &query)
        .await?
        .into_iter()
        .filter_map(|event| match event.payload {
            EventPayload::Message {
                role: MessageRole::Assistant,
                content,
            } if !content.trim().is_empty() => Some(content),
            _ => None,
        })
        .take(MAX_MESSAGE_EVENTS)
        .collect();

    if messages.is_empty() {
        return Ok(None);
    }
    Ok(Some(SourceText {
        text: truncate_chars(&messages.join("\n\n"), max_len),
        source: SOURCE_EVENTS,
    }))
}

/// Cut `text` to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunMode, RunSummary};
    use crate::store::{SqliteStore, testing::seed_run};

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[tokio::test]
    async fn test_summary_wins_over_events() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let mut run = {
            let db = store.handle().lock_sync()?;
            seed_run(&db, RunMode::InPlace)?
        };
        store.append(&run.id, EventPayload::assistant("from events")).await?;
        run.summary = Some(RunSummary {
            description: "from summary".into(),
            ..Default::default()
        });

        let text = gather(&run, &store, 100).await?.expect("text");
        assert_eq!(text.text, "from summary");
        assert_eq!(text.source, SOURCE_SUMMARY);
        Ok(())
    }

    #[tokio::test]
    async fn test_events_fallback_keeps_only_assistant_messages() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let run = {
            let db = store.handle().lock_sync()?;
            seed_run(&db, RunMode::InPlace)?
        };
        store.append(&run.id, EventPayload::system("boot")).await?;
        store.append(&run.id, EventPayload::assistant("first")).await?;
        store.append(&run.id, EventPayload::assistant("second")).await?;

        let text = gather(&run, &store, 100).await?.expect("text");
        assert_eq!(text.text, "first\n\nsecond");
        assert_eq!(text.source, SOURCE_EVENTS);

        let short = gather(&run, &store, 3).await?.expect("text");
        assert_eq!(short.text, "fir");
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_read() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let run = {
            let db = store.handle().lock_sync()?;
            seed_run(&db, RunMode::InPlace)?
        };
        assert!(gather(&run, &store, 100).await?.is_none());
        Ok(())
    }
}
