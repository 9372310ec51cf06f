//! Durable state: repository traits and their SQLite implementation.
//!
//! Every repository is an `async_trait` so the orchestrator, executor and
//! background loops can be driven against any backend. `SqliteStore`
//! implements all of them over one database through [`DbHandle`].

mod catalog;
mod checkpoints;
pub mod db;
mod events;
mod idempotency;
mod investigations;
mod runs;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::domain::{
    AgentProfile, ApprovalState, EventPayload, IdempotencyRecord, Investigation,
    RecommendationState, Run, RunCheckpoint, RunEvent, RunPhase, RunStatus, Task, TaskStatus,
};

pub use db::{DbHandle, StoreDb};
pub use events::EventQuery;
pub use runs::RunFilter;

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn create_profile(&self, profile: &AgentProfile) -> Result<()>;
    async fn get_profile(&self, id: &str) -> Result<Option<AgentProfile>>;
    async fn update_profile(&self, profile: &AgentProfile) -> Result<bool>;
    async fn delete_profile(&self, id: &str) -> Result<bool>;
    async fn list_profiles(&self) -> Result<Vec<AgentProfile>>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn update_task(&self, task: &Task) -> Result<bool>;
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool>;
    async fn delete_task(&self, id: &str) -> Result<bool>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, id: &str) -> Result<Option<Run>>;
    /// Full overwrite; refuses to replace a terminal status with another.
    async fn update_run(&self, run: &Run) -> Result<bool>;
    /// Compare-and-set on status. Never leaves a terminal status.
    async fn transition_status(
        &self,
        id: &str,
        expected: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> Result<bool>;
    async fn reopen_for_resume(&self, id: &str, phase: RunPhase) -> Result<bool>;
    /// Review transition of a completed run; writes phase, progress and
    /// approval only, and only while the run is still in phase `from`.
    async fn update_review(
        &self,
        id: &str,
        from: RunPhase,
        phase: RunPhase,
        approval: ApprovalState,
    ) -> Result<bool>;
    async fn touch_heartbeat(&self, id: &str) -> Result<bool>;
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>>;
    async fn delete_run(&self, id: &str) -> Result<bool>;
    async fn count_runs_for_task(&self, task_id: &str) -> Result<i64>;
    async fn count_runs_for_profile(&self, profile_id: &str) -> Result<i64>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>>;

    async fn list_pending_recommendation_extractions(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Run>>;
    async fn claim_recommendation_extraction(&self, id: &str) -> Result<bool>;
    async fn update_recommendation(&self, id: &str, state: &RecommendationState) -> Result<bool>;
    async fn recover_stale_extractions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
    async fn list_unextracted_investigation_runs(
        &self,
        tag_prefix: &str,
        limit: usize,
    ) -> Result<Vec<Run>>;

    async fn list_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        self.list_runs(RunFilter::with_statuses(statuses)).await
    }
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<()>;
    async fn get_checkpoint(&self, run_id: &str) -> Result<Option<RunCheckpoint>>;
    async fn delete_checkpoint(&self, run_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Live reservation for the key, ignoring expired ones.
    async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    /// Returns false when a live pending/complete reservation already exists.
    async fn reserve(&self, key: &str, ttl: std::time::Duration) -> Result<bool>;
    async fn complete(
        &self,
        key: &str,
        entity_id: &str,
        entity_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool>;
    async fn fail(&self, key: &str) -> Result<bool>;
}

#[async_trait]
pub trait InvestigationRepository: Send + Sync {
    async fn create_investigation(&self, investigation: &Investigation) -> Result<()>;
    async fn get_investigation(&self, id: &str) -> Result<Option<Investigation>>;
    async fn update_investigation(&self, investigation: &Investigation) -> Result<bool>;
    async fn delete_investigation(&self, id: &str) -> Result<bool>;
    async fn list_investigations(&self) -> Result<Vec<Investigation>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, run_id: &str, payload: EventPayload) -> Result<RunEvent>;
    async fn append_batch(&self, run_id: &str, payloads: Vec<EventPayload>) -> Result<Vec<RunEvent>>;
    async fn get_events(&self, run_id: &str, query: &EventQuery) -> Result<Vec<RunEvent>>;
    /// Stored events matching `query`, then live appends as they happen.
    async fn stream(&self, run_id: &str, query: EventQuery) -> Result<BoxStream<'static, RunEvent>>;
}

// ── SQLite implementation ─────────────────────────────────────────────

const LIVE_EVENT_CAPACITY: usize = 1024;

/// All repositories over one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
    live_events: broadcast::Sender<RunEvent>,
}

impl SqliteStore {
    pub fn new(db: StoreDb) -> Self {
        let (live_events, _) = broadcast::channel(LIVE_EVENT_CAPACITY);
        Self {
            db: DbHandle::new(db),
            live_events,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(StoreDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(StoreDb::new_in_memory()?))
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }
}

#[async_trait]
impl ProfileRepository for SqliteStore {
    async fn create_profile(&self, profile: &AgentProfile) -> Result<()> {
        let profile = profile.clone();
        self.db.call(move |db| db.insert_profile(&profile)).await
    }

    async fn get_profile(&self, id: &str) -> Result<Option<AgentProfile>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_profile(&id)).await
    }

    async fn update_profile(&self, profile: &AgentProfile) -> Result<bool> {
        let profile = profile.clone();
        self.db.call(move |db| db.update_profile(&profile)).await
    }

    async fn delete_profile(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |db| db.delete_profile(&id)).await
    }

    async fn list_profiles(&self) -> Result<Vec<AgentProfile>> {
        self.db.call(|db| db.list_profiles()).await
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.db.call(move |db| db.insert_task(&task)).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_task(&id)).await
    }

    async fn update_task(&self, task: &Task) -> Result<bool> {
        let task = task.clone();
        self.db.call(move |db| db.update_task(&task)).await
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |db| db.update_task_status(&id, status)).await
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |db| db.delete_task(&id)).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.db.call(|db| db.list_tasks()).await
    }
}

#[async_trait]
impl RunRepository for SqliteStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let run = run.clone();
        self.db.call(move |db| db.insert_run(&run)).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_run(&id)).await
    }

    async fn update_run(&self, run: &Run) -> Result<bool> {
        let run = run.clone();
        self.db.call(move |db| db.update_run(&run)).await
    }

    async fn transition_status(
        &self,
        id: &str,
        expected: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let id = id.to_string();
        let expected = expected.to_vec();
        self.db
            .call(move |db| {
                db.transition_run_status(&id, &expected, to, error.as_deref(), Utc::now())
            })
            .await
    }

    async fn reopen_for_resume(&self, id: &str, phase: RunPhase) -> Result<bool> {
        let id = id.to_string();
        self.db
            .call(move |db| db.reopen_run_for_resume(&id, phase, Utc::now()))
            .await
    }

    async fn update_review(
        &self,
        id: &str,
        from: RunPhase,
        phase: RunPhase,
        approval: ApprovalState,
    ) -> Result<bool> {
        let id = id.to_string();
        self.db
            .call(move |db| db.update_run_review(&id, from, phase, approval, Utc::now()))
            .await
    }

    async fn touch_heartbeat(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .call(move |db| db.touch_run_heartbeat(&id, Utc::now()))
            .await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        self.db.call(move |db| db.list_runs(&filter)).await
    }

    async fn delete_run(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |db| db.delete_run(&id)).await
    }

    async fn count_runs_for_task(&self, task_id: &str) -> Result<i64> {
        let task_id = task_id.to_string();
        self.db.call(move |db| db.count_runs_for_task(&task_id)).await
    }

    async fn count_runs_for_profile(&self, profile_id: &str) -> Result<i64> {
        let profile_id = profile_id.to_string();
        self.db
            .call(move |db| db.count_runs_for_profile(&profile_id))
            .await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>> {
        let key = key.to_string();
        self.db
            .call(move |db| db.find_run_by_idempotency_key(&key))
            .await
    }

    async fn list_pending_recommendation_extractions(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Run>> {
        self.db
            .call(move |db| db.list_pending_recommendation_extractions(max_retries, limit))
            .await
    }

    async fn claim_recommendation_extraction(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .call(move |db| db.claim_recommendation_extraction(&id, Utc::now()))
            .await
    }

    async fn update_recommendation(&self, id: &str, state: &RecommendationState) -> Result<bool> {
        let id = id.to_string();
        let state = state.clone();
        self.db
            .call(move |db| db.update_recommendation_state(&id, &state, Utc::now()))
            .await
    }

    async fn recover_stale_extractions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.db
            .call(move |db| db.recover_stale_extractions(cutoff, Utc::now()))
            .await
    }

    async fn list_unextracted_investigation_runs(
        &self,
        tag_prefix: &str,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let tag_prefix = tag_prefix.to_string();
        self.db
            .call(move |db| db.list_unextracted_investigation_runs(&tag_prefix, limit))
            .await
    }
}

#[async_trait]
impl CheckpointRepository for SqliteStore {
    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let checkpoint = checkpoint.clone();
        self.db.call(move |db| db.save_checkpoint(&checkpoint)).await
    }

    async fn get_checkpoint(&self, run_id: &str) -> Result<Option<RunCheckpoint>> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.get_checkpoint(&run_id)).await
    }

    async fn delete_checkpoint(&self, run_id: &str) -> Result<bool> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.delete_checkpoint(&run_id)).await
    }
}

#[async_trait]
impl IdempotencyRepository for SqliteStore {
    async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let key = key.to_string();
        self.db
            .call(move |db| db.check_idempotency(&key, Utc::now()))
            .await
    }

    async fn reserve(&self, key: &str, ttl: std::time::Duration) -> Result<bool> {
        let key = key.to_string();
        let ttl = chrono::Duration::from_std(ttl)?;
        self.db
            .call(move |db| db.reserve_idempotency(&key, ttl, Utc::now()))
            .await
    }

    async fn complete(
        &self,
        key: &str,
        entity_id: &str,
        entity_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        let key = key.to_string();
        let entity_id = entity_id.to_string();
        let entity_type = entity_type.to_string();
        self.db
            .call(move |db| {
                db.complete_idempotency(&key, &entity_id, &entity_type, metadata.as_ref())
            })
            .await
    }

    async fn fail(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.db.call(move |db| db.fail_idempotency(&key)).await
    }
}

#[async_trait]
impl InvestigationRepository for SqliteStore {
    async fn create_investigation(&self, investigation: &Investigation) -> Result<()> {
        let investigation = investigation.clone();
        self.db
            .call(move |db| db.insert_investigation(&investigation))
            .await
    }

    async fn get_investigation(&self, id: &str) -> Result<Option<Investigation>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_investigation(&id)).await
    }

    async fn update_investigation(&self, investigation: &Investigation) -> Result<bool> {
        let investigation = investigation.clone();
        self.db
            .call(move |db| db.update_investigation(&investigation))
            .await
    }

    async fn delete_investigation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |db| db.delete_investigation(&id)).await
    }

    async fn list_investigations(&self) -> Result<Vec<Investigation>> {
        self.db.call(|db| db.list_investigations()).await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append(&self, run_id: &str, payload: EventPayload) -> Result<RunEvent> {
        let mut events = self.append_batch(run_id, vec![payload]).await?;
        events
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Event append returned nothing"))
    }

    async fn append_batch(&self, run_id: &str, payloads: Vec<EventPayload>) -> Result<Vec<RunEvent>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let run_id = run_id.to_string();
        let events = self
            .db
            .call(move |db| db.append_events(&run_id, &payloads, Utc::now()))
            .await?;
        for event in &events {
            // No subscribers is fine.
            let _ = self.live_events.send(event.clone());
        }
        Ok(events)
    }

    async fn get_events(&self, run_id: &str, query: &EventQuery) -> Result<Vec<RunEvent>> {
        let run_id = run_id.to_string();
        let query = query.clone();
        self.db.call(move |db| db.get_events(&run_id, &query)).await
    }

    async fn stream(&self, run_id: &str, query: EventQuery) -> Result<BoxStream<'static, RunEvent>> {
        // Subscribe before reading so nothing slips between the two.
        let receiver = self.live_events.subscribe();
        let stored = self.get_events(run_id, &query).await?;

        let mut live_query = query;
        live_query.limit = None;
        live_query.after_sequence = stored
            .last()
            .map(|e| e.sequence)
            .or(live_query.after_sequence);

        let run_id = run_id.to_string();
        let live = tokio_stream::StreamExt::filter_map(BroadcastStream::new(receiver), move |item| {
            match item {
                Ok(event) if event.run_id == run_id && live_query.matches(&event) => Some(event),
                _ => None,
            }
        });
        Ok(futures::stream::iter(stored).chain(live).boxed())
    }
}

/// Repository bundle handed to the orchestrator and background loops.
#[derive(Clone)]
pub struct Repositories {
    pub profiles: Arc<dyn ProfileRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub investigations: Arc<dyn InvestigationRepository>,
    pub events: Arc<dyn EventStore>,
}

impl Repositories {
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            profiles: store.clone(),
            tasks: store.clone(),
            runs: store.clone(),
            checkpoints: store.clone(),
            idempotency: store.clone(),
            investigations: store.clone(),
            events: store,
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::sqlite(SqliteStore::in_memory()?))
    }
}
