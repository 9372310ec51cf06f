//! Heartbeat subtask: the only periodic writer of `last_heartbeat`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::RunRepository;

pub struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

impl Heartbeat {
    /// Start beating for `run_id`. The task stops when [`Heartbeat::stop`] is
    /// called or `parent` is cancelled.
    pub fn start(
        run_id: &str,
        runs: Arc<dyn RunRepository>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let run_id = run_id.to_string();
        let handle = tokio::spawn(async move {
            let mut beats = 0u64;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match runs.touch_heartbeat(&run_id).await {
                            Ok(true) => beats += 1,
                            Ok(false) => tracing::trace!(run_id = %run_id, "Run not live; heartbeat skipped"),
                            Err(e) => tracing::warn!(run_id = %run_id, error = %format!("{:#}", e), "Heartbeat write failed"),
                        }
                    }
                }
            }
            beats
        });
        Self { cancel, handle }
    }

    /// Stop the task and wait for it to exit. Returns the number of
    /// heartbeats written.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        match self.handle.await {
            Ok(beats) => beats,
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat task panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunMode, RunStatus};
    use crate::store::{SqliteStore, testing::seed_run};

    #[tokio::test]
    async fn test_heartbeat_writes_while_live_and_stops_cleanly() -> anyhow::Result<()> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let mut run = {
            let db = store.handle().lock_sync()?;
            seed_run(&db, RunMode::InPlace)?
        };
        run.status = RunStatus::Running;
        store.update_run(&run).await?;

        let parent = CancellationToken::new();
        let heartbeat = Heartbeat::start(&run.id, store.clone(), Duration::from_millis(20), &parent);
        tokio::time::sleep(Duration::from_millis(90)).await;
        let beats = heartbeat.stop().await;

        assert!(beats >= 2, "expected several beats, got {}", beats);
        let stored = store.get_run(&run.id).await?.expect("run");
        assert!(stored.last_heartbeat.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_heartbeat() -> anyhow::Result<()> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let parent = CancellationToken::new();
        let heartbeat = Heartbeat::start("missing", store, Duration::from_millis(10), &parent);
        parent.cancel();
        let beats = tokio::time::timeout(Duration::from_secs(1), heartbeat.stop()).await?;
        assert_eq!(beats, 0);
        Ok(())
    }
}
