//! Periodic reconciliation of persisted run state against the OS.
//!
//! Each cycle finds live runs whose heartbeat went quiet and checks whether
//! their process still exists, then scans agent processes for tags that no
//! live run owns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{Broadcaster, NullBroadcaster};
use crate::domain::{
    Allowlist, AllowlistRule, INVESTIGATION_TAG_PREFIX, Run, RunStatus, RunnerKind,
    is_agent_manager_tag,
};
use crate::errors::OrchestratorError;
use crate::process::{ProcessInfo, ProcessProbe};
use crate::store::RunRepository;
use crate::terminator::Terminator;

pub const PROCESS_GONE_REASON: &str = "process terminated unexpectedly";

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub stale_threshold: Duration,
    /// Minimum age before an unowned agent process counts as an orphan.
    pub orphan_grace_period: Duration,
    /// Stale runs examined per cycle.
    pub max_stale_runs: usize,
    pub kill_orphans: bool,
    pub auto_recover: bool,
    /// Terms passed to the process listing.
    pub agent_terms: Vec<String>,
    /// Extra tag patterns treated as agent-manager owned.
    pub allowlist: Vec<AllowlistRule>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            orphan_grace_period: Duration::from_secs(5 * 60),
            max_stale_runs: 50,
            kill_orphans: false,
            auto_recover: false,
            agent_terms: RunnerKind::ALL
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            allowlist: vec![AllowlistRule::literal(INVESTIGATION_TAG_PREFIX)],
        }
    }
}

impl ReconcilerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_orphan_grace_period(mut self, grace: Duration) -> Self {
        self.orphan_grace_period = grace;
        self
    }

    pub fn with_max_stale_runs(mut self, max: usize) -> Self {
        self.max_stale_runs = max;
        self
    }

    pub fn with_kill_orphans(mut self, enabled: bool) -> Self {
        self.kill_orphans = enabled;
        self
    }

    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    pub fn with_agent_terms(mut self, terms: Vec<String>) -> Self {
        self.agent_terms = terms;
        self
    }

    pub fn with_allowlist(mut self, rules: Vec<AllowlistRule>) -> Self {
        self.allowlist = rules;
        self
    }
}

/// Counters for one cycle, or accumulated over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    pub checked: usize,
    pub stale: usize,
    /// Stale runs flipped to failed because their process was gone.
    pub failed: usize,
    pub orphans: usize,
    pub recovered: usize,
    pub killed: usize,
    pub errors: usize,
}

impl ReconcilerStats {
    fn add(&mut self, other: &ReconcilerStats) {
        self.checked += other.checked;
        self.stale += other.stale;
        self.failed += other.failed;
        self.orphans += other.orphans;
        self.recovered += other.recovered;
        self.killed += other.killed;
        self.errors += other.errors;
    }
}

#[derive(Default)]
struct LoopState {
    task: Option<(CancellationToken, JoinHandle<()>)>,
    last: Option<ReconcilerStats>,
    total: ReconcilerStats,
    cycles: u64,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    runs: Arc<dyn RunRepository>,
    probe: Arc<dyn ProcessProbe>,
    terminator: Option<Arc<Terminator>>,
    broadcaster: Arc<dyn Broadcaster>,
    allowlist: Allowlist,
    state: Mutex<LoopState>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        runs: Arc<dyn RunRepository>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let allowlist = Allowlist::compile_lossy(&config.allowlist);
        Self {
            config,
            runs,
            probe,
            terminator: None,
            broadcaster: Arc::new(NullBroadcaster),
            allowlist,
            state: Mutex::new(LoopState::default()),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
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

    /// Stats of the most recent cycle.
    pub fn last_stats(&self) -> Option<ReconcilerStats> {
        self.lock_state().last
    }

    pub fn total_stats(&self) -> ReconcilerStats {
        self.lock_state().total
    }

    pub fn cycles(&self) -> u64 {
        self.lock_state().cycles
    }

    /// Start the background loop. A second start while running is refused.
    pub fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let mut state = self.lock_state();
        if state.task.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return Err(OrchestratorError::InvalidState(
                "reconciler is already running".to_string(),
            ));
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
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
            tracing::debug!("Reconciler loop exited");
        });
        state.task = Some((cancel, handle));
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            kill_orphans = self.config.kill_orphans,
            auto_recover = self.config.auto_recover,
            "Reconciler started"
        );
        Ok(())
    }

    /// Stop the loop and wait for the in-flight cycle. No-op when idle.
    pub async fn stop(&self) {
        let task = self.lock_state().task.take();
        let Some((cancel, handle)) = task else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Reconciler task panicked");
        }
        tracing::info!("Reconciler stopped");
    }

    /// One reconciliation cycle. Per-run failures are counted, never raised.
    pub async fn run_once(&self) -> ReconcilerStats {
        let mut stats = ReconcilerStats::default();

        let live = match self
            .runs
            .list_by_status(&[RunStatus::Running, RunStatus::Starting])
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Failed to list live runs");
                stats.errors += 1;
                Vec::new()
            }
        };
        let known_tags: HashSet<String> = live
            .iter()
            .map(|r| r.effective_tag().to_string())
            .collect();

        self.check_stale(&live, &mut stats).await;
        self.check_orphans(&known_tags, &mut stats).await;

        if stats.stale > 0 || stats.orphans > 0 || stats.errors > 0 {
            tracing::info!(
                checked = stats.checked,
                stale = stats.stale,
                failed = stats.failed,
                orphans = stats.orphans,
                recovered = stats.recovered,
                killed = stats.killed,
                errors = stats.errors,
                "Reconcile cycle complete"
            );
        } else {
            tracing::debug!(checked = stats.checked, "Reconcile cycle complete");
        }

        let mut state = self.lock_state();
        state.last = Some(stats);
        state.total.add(&stats);
        state.cycles += 1;
        stats
    }

    async fn check_stale(&self, live: &[Run], stats: &mut ReconcilerStats) {
        let now = Utc::now();
        for run in live {
            stats.checked += 1;
            if !run.is_stale(self.config.stale_threshold, now) {
                continue;
            }
            if stats.stale >= self.config.max_stale_runs {
                tracing::debug!(run_id = %run.id, "Stale run limit reached for this cycle");
                continue;
            }
            stats.stale += 1;
            if let Err(e) = self.reconcile_stale(run, stats).await {
                tracing::warn!(run_id = %run.id, error = %format!("{:#}", e), "Failed to reconcile stale run");
                stats.errors += 1;
            }
        }
    }

    async fn reconcile_stale(&self, run: &Run, stats: &mut ReconcilerStats) -> Result<()> {
        let tag = run.effective_tag();
        let pids = self.probe.find_by_tag(tag).await?;

        if pids.is_empty() {
            let moved = self
                .runs
                .transition_status(
                    &run.id,
                    &[RunStatus::Running, RunStatus::Starting],
                    RunStatus::Failed,
                    Some(PROCESS_GONE_REASON.to_string()),
                )
                .await?;
            if moved {
                stats.failed += 1;
                tracing::warn!(run_id = %run.id, tag, "Stale run has no process; marked failed");
                if let Some(updated) = self.runs.get_run(&run.id).await? {
                    self.broadcaster.broadcast_run_status(&updated);
                }
            }
            return Ok(());
        }

        if self.config.auto_recover {
            if self.runs.touch_heartbeat(&run.id).await? {
                stats.recovered += 1;
                tracing::info!(run_id = %run.id, tag, pids = ?pids, "Stale run still alive; heartbeat refreshed");
                if let Some(updated) = self.runs.get_run(&run.id).await? {
                    self.broadcaster.broadcast_run_status(&updated);
                }
            }
        } else {
            tracing::warn!(run_id = %run.id, tag, pids = ?pids, "Stale run still has a live process; leaving in place");
        }
        Ok(())
    }

    async fn check_orphans(&self, known_tags: &HashSet<String>, stats: &mut ReconcilerStats) {
        let processes = match self.probe.list_agent_processes(&self.config.agent_terms).await {
            Ok(processes) => processes,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Failed to list agent processes");
                stats.errors += 1;
                return;
            }
        };

        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.orphan_grace_period)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut handled: HashSet<String> = HashSet::new();

        for process in processes {
            let Some(tag) = process.tag.clone() else {
                continue;
            };
            if known_tags.contains(&tag)
                || handled.contains(&tag)
                || !is_agent_manager_tag(&tag, &self.allowlist)
            {
                continue;
            }
            let started_at = match self.probe.started_at(process.pid).await {
                Ok(Some(started_at)) => started_at,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(pid = process.pid, error = %format!("{:#}", e), "Could not read process start time");
                    stats.errors += 1;
                    continue;
                }
            };
            if now - started_at < grace {
                continue;
            }

            handled.insert(tag.clone());
            stats.orphans += 1;
            self.handle_orphan(&process, &tag, stats).await;
        }
    }

    async fn handle_orphan(&self, process: &ProcessInfo, tag: &str, stats: &mut ReconcilerStats) {
        let terminator = match (&self.terminator, self.config.kill_orphans) {
            (Some(terminator), true) => terminator,
            _ => {
                tracing::warn!(pid = process.pid, tag, "Orphaned agent process detected");
                return;
            }
        };
        let kind = RunnerKind::ALL
            .into_iter()
            .find(|k| process.command.contains(k.as_str()));
        let outcome = terminator.terminate_tag(tag, kind).await;
        if outcome.success {
            stats.killed += 1;
            tracing::info!(
                pid = process.pid,
                tag,
                method = outcome.final_method.map(|m| m.as_str()).unwrap_or("none"),
                "Orphaned agent process terminated"
            );
        } else {
            stats.errors += 1;
            tracing::error!(
                pid = process.pid,
                tag,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Failed to terminate orphaned agent process"
            );
        }
    }
}
