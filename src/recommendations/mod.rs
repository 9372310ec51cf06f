//! Recommendation Worker: a claim-based queue over investigation runs.
//!
//! A run's `recommendation.status` is its queue position:
//!
//! ```text
//! none → pending → extracting → complete
//!                      │
//!                      └→ pending (retry, backoff) … → failed
//! ```
//!
//! The claim is a compare-and-set in the store, so several workers (or
//! overlapping cycles) never extract the same run twice.

pub mod text;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{Broadcaster, ExtractionRequest, NullBroadcaster, RecommendationExtractor};
use crate::domain::{
    Allowlist, AllowlistRule, INVESTIGATION_TAG_PREFIX, RecommendationResult,
    RecommendationState, RecommendationStatus, Run,
};
use crate::errors::OrchestratorError;
use crate::store::{EventStore, RunRepository};

/// Upper bound on runs queued by one seeding pass.
pub const SEED_LIMIT: usize = 100;
/// Rows examined when seeding has to match tags outside SQL.
const SEED_SCAN_WINDOW: usize = 1000;

/// Pending runs inspected per cycle, before allowlist filtering.
const LIST_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub interval: Duration,
    /// Attempts before an extraction is parked as failed.
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts.
    pub retry_backoff: Duration,
    pub max_concurrent: usize,
    /// Extractions claimed longer ago than this are rolled back to pending.
    pub stale_timeout: Duration,
    pub extraction_timeout: Duration,
    pub max_text_length: usize,
    pub allowlist: Vec<AllowlistRule>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(60),
            max_concurrent: 1,
            stale_timeout: Duration::from_secs(5 * 60),
            extraction_timeout: Duration::from_secs(120),
            max_text_length: 10_000,
            allowlist: vec![AllowlistRule::literal(INVESTIGATION_TAG_PREFIX)],
        }
    }
}

impl WorkerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    pub fn with_max_text_length(mut self, max: usize) -> Self {
        self.max_text_length = max;
        self
    }

    pub fn with_allowlist(mut self, rules: Vec<AllowlistRule>) -> Self {
        self.allowlist = rules;
        self
    }

    /// Minimum wait before attempt `attempts + 1`.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempts - 1);
        self.retry_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub recovered: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed but still inside the retry backoff window.
    pub deferred: usize,
    pub lost_claims: usize,
    pub errors: usize,
}

impl WorkerStats {
    fn add(&mut self, other: &WorkerStats) {
        self.recovered += other.recovered;
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.lost_claims += other.lost_claims;
        self.errors += other.errors;
    }
}

/// Result of extracting one claimed run.
enum Outcome {
    Succeeded,
    Retry,
    Failed,
}

#[derive(Default)]
struct LoopState {
    task: Option<(CancellationToken, JoinHandle<()>)>,
    last: Option<WorkerStats>,
    total: WorkerStats,
}

pub struct RecommendationWorker {
    config: WorkerConfig,
    runs: Arc<dyn RunRepository>,
    events: Arc<dyn EventStore>,
    extractor: Option<Arc<dyn RecommendationExtractor>>,
    broadcaster: Arc<dyn Broadcaster>,
    allowlist: Allowlist,
    state: Mutex<LoopState>,
}

impl RecommendationWorker {
    pub fn new(
        config: WorkerConfig,
        runs: Arc<dyn RunRepository>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        let allowlist = Allowlist::compile_lossy(&config.allowlist);
        Self {
            config,
            runs,
            events,
            extractor: None,
            broadcaster: Arc::new(NullBroadcaster),
            allowlist,
            state: Mutex::new(LoopState::default()),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn RecommendationExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_allowed(&self, run: &Run) -> bool {
        run.tag.as_deref().is_some_and(|tag| self.allowlist.matches(tag))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock_state()
            .task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn last_stats(&self) -> Option<WorkerStats> {
        self.lock_state().last
    }

    pub fn total_stats(&self) -> WorkerStats {
        self.lock_state().total
    }

    /// Seed the queue, then run a cycle every `interval` until stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let mut state = self.lock_state();
        if state.task.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return Err(OrchestratorError::InvalidState(
                "recommendation worker is already running".to_string(),
            ));
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match this.seed().await {
                Ok(0) => {}
                Ok(seeded) => tracing::info!(seeded, "Queued investigation runs for extraction"),
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "Failed to seed extraction queue"),
            }
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.run_once().await;
                    }
                }
            }
        });
        state.task = Some((cancel, handle));
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_retries = self.config.max_retries,
            max_concurrent = self.config.max_concurrent,
            "Recommendation worker started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let task = self.lock_state().task.take();
        let Some((cancel, handle)) = task else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Recommendation worker task panicked");
        }
        tracing::info!("Recommendation worker stopped");
    }

    /// Queue completed investigation runs that never had an extraction.
    /// Returns how many were queued.
    pub async fn seed(&self) -> Result<usize> {
        let rules = &self.config.allowlist;
        let mut scans: Vec<(String, usize)> = vec![(INVESTIGATION_TAG_PREFIX.to_string(), SEED_LIMIT)];
        // Literals become prefix queries. A regex has no prefix, so it scans
        // every tagged run and leaves matching to the allowlist.
        if rules.iter().any(|rule| rule.is_regex) {
            scans.push((String::new(), SEED_SCAN_WINDOW));
        } else {
            for rule in rules {
                if !scans.iter().any(|(p, _)| p.eq_ignore_ascii_case(&rule.pattern)) {
                    scans.push((rule.pattern.clone(), SEED_LIMIT));
                }
            }
        }

        let mut candidates: Vec<Run> = Vec::new();
        let mut seen = HashSet::new();
        for (prefix, limit) in &scans {
            for run in self
                .runs
                .list_unextracted_investigation_runs(prefix, *limit)
                .await?
            {
                if seen.insert(run.id.clone()) {
                    candidates.push(run);
                }
            }
        }
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let now = Utc::now();
        let mut queued = 0;
        for run in candidates
            .into_iter()
            .filter(|r| self.is_allowed(r))
            .take(SEED_LIMIT)
        {
            let state = RecommendationState {
                status: RecommendationStatus::Pending,
                attempts: 0,
                queued_at: Some(now),
                result: None,
                error: None,
            };
            if self.runs.update_recommendation(&run.id, &state).await? {
                queued += 1;
                self.broadcast(&run.id).await;
            }
        }
        Ok(queued)
    }

    /// One pass over the queue. Per-run failures are counted, never raised.
    pub async fn run_once(&self) -> WorkerStats {
        let mut stats = WorkerStats::default();

        let Some(extractor) = self.extractor.clone() else {
            tracing::debug!("No extractor configured; skipping cycle");
            return stats;
        };
        if !extractor.is_available().await {
            tracing::debug!("Extractor unavailable; skipping cycle");
            return stats;
        }

        self.recover_stale(&mut stats).await;

        let pending = match self
            .runs
            .list_pending_recommendation_extractions(self.config.max_retries, LIST_WINDOW)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Failed to list pending extractions");
                stats.errors += 1;
                self.record(stats);
                return stats;
            }
        };

        let mut claimed = Vec::new();
        for run in pending {
            if claimed.len() >= self.config.max_concurrent {
                break;
            }
            // Runs outside the allowlist keep their status untouched.
            if !self.is_allowed(&run) {
                continue;
            }
            match self.claim(&run.id, &mut stats).await {
                Ok(Some(run)) => claimed.push(run),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %format!("{:#}", e), "Failed to claim extraction");
                    stats.errors += 1;
                }
            }
        }

        let results = futures::future::join_all(
            claimed
                .iter()
                .map(|run| self.process(run, extractor.as_ref())),
        )
        .await;
        for (run, result) in claimed.iter().zip(results) {
            stats.processed += 1;
            match result {
                Ok(Outcome::Succeeded) => stats.succeeded += 1,
                Ok(Outcome::Retry) => stats.retried += 1,
                Ok(Outcome::Failed) => stats.failed += 1,
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %format!("{:#}", e), "Failed to record extraction result");
                    stats.errors += 1;
                }
            }
        }

        if stats != WorkerStats::default() {
            tracing::info!(
                recovered = stats.recovered,
                processed = stats.processed,
                succeeded = stats.succeeded,
                retried = stats.retried,
                failed = stats.failed,
                deferred = stats.deferred,
                errors = stats.errors,
                "Recommendation cycle complete"
            );
        }
        self.record(stats);
        stats
    }

    fn record(&self, stats: WorkerStats) {
        let mut state = self.lock_state();
        state.last = Some(stats);
        state.total.add(&stats);
    }

    async fn recover_stale(&self, stats: &mut WorkerStats) {
        let stale_for = chrono::Duration::from_std(self.config.stale_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - stale_for;
        match self.runs.recover_stale_extractions(cutoff).await {
            Ok(ids) => {
                for id in &ids {
                    tracing::warn!(run_id = %id, "Recovered stale recommendation extraction");
                    self.broadcast(id).await;
                }
                stats.recovered += ids.len();
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Stale extraction recovery failed");
                stats.errors += 1;
            }
        }
    }

    /// Claim `run_id` and apply the backoff gate. Returns the fresh run when
    /// it is ready to extract.
    async fn claim(&self, run_id: &str, stats: &mut WorkerStats) -> Result<Option<Run>> {
        if !self.runs.claim_recommendation_extraction(run_id).await? {
            tracing::debug!(run_id, "Extraction claimed elsewhere");
            stats.lost_claims += 1;
            return Ok(None);
        }
        let Some(run) = self.runs.get_run(run_id).await? else {
            return Ok(None);
        };

        let rec = &run.recommendation;
        if rec.attempts > 0 {
            let wait = chrono::Duration::from_std(self.config.backoff_after(rec.attempts))
                .unwrap_or_else(|_| chrono::Duration::days(1));
            let since = rec.queued_at.unwrap_or(run.updated_at);
            if Utc::now() - since < wait {
                // Back to the state it was claimed from.
                let mut restored = rec.clone();
                restored.status = if rec.attempts >= self.config.max_retries {
                    RecommendationStatus::Failed
                } else {
                    RecommendationStatus::Pending
                };
                self.runs.update_recommendation(run_id, &restored).await?;
                stats.deferred += 1;
                return Ok(None);
            }
        }
        Ok(Some(run))
    }

    async fn process(&self, run: &Run, extractor: &dyn RecommendationExtractor) -> Result<Outcome> {
        let source = text::gather(run, self.events.as_ref(), self.config.max_text_length).await?;

        // On failure, keep whatever the extractor returned for display.
        let attempt: Result<RecommendationResult, (String, Option<RecommendationResult>)> =
            match &source {
                None => Err((
                    "no summary or assistant messages to extract from".to_string(),
                    None,
                )),
                Some(source) => {
                    let request = ExtractionRequest {
                        text: source.text.clone(),
                        max_length: self.config.max_text_length,
                        source: source.source.to_string(),
                    };
                    match tokio::time::timeout(
                        self.config.extraction_timeout,
                        extractor.extract(&request),
                    )
                    .await
                    {
                        Ok(Ok(result)) if result.success => Ok(result),
                        Ok(Ok(result)) => {
                            let error = result
                                .error
                                .clone()
                                .unwrap_or_else(|| "extractor reported failure".to_string());
                            Err((error, Some(result)))
                        }
                        Ok(Err(e)) => Err((format!("{:#}", e), None)),
                        Err(_) => Err((
                            format!(
                                "extraction timed out after {}s",
                                self.config.extraction_timeout.as_secs()
                            ),
                            None,
                        )),
                    }
                }
            };

        let mut state = run.recommendation.clone();
        let outcome = match attempt {
            Ok(result) => {
                state.status = RecommendationStatus::Complete;
                state.result = Some(result);
                state.error = None;
                tracing::info!(run_id = %run.id, "Recommendations extracted");
                Outcome::Succeeded
            }
            Err((error, partial)) => {
                state.attempts += 1;
                state.result =
                    Some(partial.unwrap_or_else(|| fallback_result(source.as_ref(), &error)));
                state.error = Some(error.clone());
                if state.attempts >= self.config.max_retries {
                    state.status = RecommendationStatus::Failed;
                    tracing::warn!(run_id = %run.id, attempts = state.attempts, error = %error, "Recommendation extraction failed permanently");
                    Outcome::Failed
                } else {
                    state.status = RecommendationStatus::Pending;
                    state.queued_at = Some(Utc::now());
                    tracing::warn!(run_id = %run.id, attempt = state.attempts, error = %error, "Recommendation extraction failed; will retry");
                    Outcome::Retry
                }
            }
        };

        self.runs.update_recommendation(&run.id, &state).await?;
        self.broadcast(&run.id).await;
        Ok(outcome)
    }

    async fn broadcast(&self, run_id: &str) {
        match self.runs.get_run(run_id).await {
            Ok(Some(run)) => self.broadcaster.broadcast_run_status(&run),
            Ok(None) => {}
            Err(e) => tracing::debug!(run_id, error = %format!("{:#}", e), "Could not reload run for broadcast"),
        }
    }
}

/// Keeps the source text visible when extraction did not produce categories.
fn fallback_result(source: Option<&text::SourceText>, error: &str) -> RecommendationResult {
    RecommendationResult {
        success: false,
        categories: Vec::new(),
        raw_text: source.map(|s| s.text.clone()).unwrap_or_default(),
        extracted_from: source.map(|s| s.source.to_string()).unwrap_or_default(),
        error: Some(error.to_string()),
    }
}
