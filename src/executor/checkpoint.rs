//! In-memory checkpoint for one run, mirrored to the checkpoint repository.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{RunCheckpoint, RunPhase};
use crate::errors::PhaseError;
use crate::store::CheckpointRepository;

#[derive(Clone)]
pub struct CheckpointTracker {
    current: Arc<Mutex<RunCheckpoint>>,
    repo: Option<Arc<dyn CheckpointRepository>>,
}

impl CheckpointTracker {
    pub fn new(initial: RunCheckpoint, repo: Option<Arc<dyn CheckpointRepository>>) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
            repo,
        }
    }

    pub async fn snapshot(&self) -> RunCheckpoint {
        self.current.lock().await.clone()
    }

    /// Record entry into `phase` and persist.
    pub async fn advance(&self, phase: RunPhase) -> Result<(), PhaseError> {
        {
            let mut cp = self.current.lock().await;
            cp.phase = phase;
            cp.created_at = Utc::now();
        }
        self.persist().await
    }

    pub async fn record_sandbox(
        &self,
        sandbox_id: Option<&str>,
        work_dir: &Path,
    ) -> Result<(), PhaseError> {
        {
            let mut cp = self.current.lock().await;
            cp.sandbox_id = sandbox_id.map(str::to_string);
            cp.work_dir = Some(work_dir.to_string_lossy().into_owned());
            cp.created_at = Utc::now();
        }
        self.persist().await
    }

    pub async fn record_lock(&self, lock_id: Option<String>) -> Result<(), PhaseError> {
        {
            let mut cp = self.current.lock().await;
            cp.lock_id = lock_id;
        }
        self.persist().await
    }

    pub async fn persist(&self) -> Result<(), PhaseError> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };
        let snapshot = self.snapshot().await;
        repo.save_checkpoint(&snapshot)
            .await
            .map_err(PhaseError::database)
    }

    pub async fn discard(&self) {
        let Some(repo) = &self.repo else {
            return;
        };
        let run_id = self.current.lock().await.run_id.clone();
        if let Err(e) = repo.delete_checkpoint(&run_id).await {
            tracing::warn!(run_id = %run_id, error = %format!("{:#}", e), "Failed to delete checkpoint");
        }
    }

    /// Re-persist the current checkpoint every `interval` until `cancel`
    /// fires.
    pub fn spawn_periodic(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; phases persist on entry anyway.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.persist().await {
                            tracing::warn!(error = %e, "Periodic checkpoint failed");
                        }
                    }
                }
            }
        })
    }
}
