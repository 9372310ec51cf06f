//! Escalating, verified termination of runner processes.
//!
//! Each pass walks the ladder runner stop → CLI stop → SIGTERM → SIGKILL →
//! process-group SIGKILL, re-scanning for the tag after every step and
//! stopping at the first step that leaves no matching process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::adapters::{Broadcaster, NullBroadcaster, RunnerRegistry};
use crate::domain::{Run, RunStatus, RunnerKind};
use crate::process::{ProcessProbe, Signal};
use crate::store::RunRepository;

const KILL_SETTLE: Duration = Duration::from_millis(500);
const VERIFY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct TerminatorConfig {
    pub grace_period: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub verify_timeout: Duration,
    pub kill_process_group: bool,
    pub cli_fallback: bool,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(2),
            kill_process_group: true,
            cli_fallback: true,
        }
    }
}

impl TerminatorConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_verify_timeout(mut self, verify_timeout: Duration) -> Self {
        self.verify_timeout = verify_timeout;
        self
    }

    pub fn with_kill_process_group(mut self, enabled: bool) -> Self {
        self.kill_process_group = enabled;
        self
    }

    pub fn with_cli_fallback(mut self, enabled: bool) -> Self {
        self.cli_fallback = enabled;
        self
    }

    /// Delay before pass `attempt` (1-based): `base · 2^(attempt−1)`,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMethod {
    AlreadyGone,
    RunnerStop,
    CliStop,
    Sigterm,
    Sigkill,
    ProcessGroupKill,
}

impl TerminationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyGone => "already_gone",
            Self::RunnerStop => "runner_stop",
            Self::CliStop => "cli_stop",
            Self::Sigterm => "sigterm",
            Self::Sigkill => "sigkill",
            Self::ProcessGroupKill => "process_group_kill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationOutcome {
    pub success: bool,
    pub final_method: Option<TerminationMethod>,
    pub attempts: u32,
    pub process_was_gone: bool,
    pub error: Option<String>,
}

impl TerminationOutcome {
    fn done(method: TerminationMethod, attempts: u32) -> Self {
        Self {
            success: true,
            final_method: Some(method),
            attempts,
            process_was_gone: method == TerminationMethod::AlreadyGone,
            error: None,
        }
    }
}

pub struct Terminator {
    config: TerminatorConfig,
    probe: Arc<dyn ProcessProbe>,
    runners: RunnerRegistry,
    runs: Option<Arc<dyn RunRepository>>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Terminator {
    pub fn new(config: TerminatorConfig, probe: Arc<dyn ProcessProbe>, runners: RunnerRegistry) -> Self {
        Self {
            config,
            probe,
            runners,
            runs: None,
            broadcaster: Arc::new(NullBroadcaster),
        }
    }

    pub fn with_runs(mut self, runs: Arc<dyn RunRepository>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn config(&self) -> &TerminatorConfig {
        &self.config
    }

    /// Terminate the process behind `run` and, on success, mark the run
    /// cancelled.
    pub async fn terminate_run(&self, run: &Run) -> TerminationOutcome {
        let kind = run.resolved_config.as_ref().map(|c| c.runner_kind);
        let outcome = self
            .escalate(Some(&run.id), run.effective_tag(), kind)
            .await;
        if outcome.success
            && let Err(e) = self.mark_cancelled(run).await
        {
            tracing::warn!(run_id = %run.id, error = %format!("{:#}", e), "Failed to mark terminated run cancelled");
        }
        outcome
    }

    /// Terminate whatever carries `tag`, with no run record involved.
    pub async fn terminate_tag(&self, tag: &str, kind: Option<RunnerKind>) -> TerminationOutcome {
        self.escalate(None, tag, kind).await
    }

    async fn mark_cancelled(&self, run: &Run) -> Result<()> {
        let Some(runs) = &self.runs else {
            return Ok(());
        };
        let moved = runs
            .transition_status(
                &run.id,
                &[RunStatus::Pending, RunStatus::Starting, RunStatus::Running],
                RunStatus::Cancelled,
                Some("terminated".to_string()),
            )
            .await?;
        if moved && let Some(updated) = runs.get_run(&run.id).await? {
            self.broadcaster.broadcast_run_status(&updated);
        }
        Ok(())
    }

    async fn escalate(
        &self,
        run_id: Option<&str>,
        tag: &str,
        kind: Option<RunnerKind>,
    ) -> TerminationOutcome {
        match self.probe.find_by_tag(tag).await {
            Ok(pids) if pids.is_empty() => {
                tracing::info!(tag, "Process already gone");
                return TerminationOutcome::done(TerminationMethod::AlreadyGone, 1);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(tag, error = %format!("{:#}", e), "Process scan failed before termination");
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            if attempt > 1 {
                let delay = self.config.backoff_for(attempt - 1);
                tracing::debug!(tag, attempt, delay_ms = delay.as_millis() as u64, "Backing off before next termination pass");
                tokio::time::sleep(delay).await;
            }
            match self.pass(run_id, tag, kind).await {
                Ok(Some(method)) => {
                    tracing::info!(tag, attempt, method = method.as_str(), "Process terminated");
                    return TerminationOutcome::done(method, attempt);
                }
                Ok(None) => {
                    tracing::warn!(tag, attempt, "Process survived termination pass");
                }
                Err(e) => {
                    tracing::warn!(tag, attempt, error = %format!("{:#}", e), "Termination pass failed");
                    last_error = Some(format!("{:#}", e));
                }
            }
        }

        TerminationOutcome {
            success: false,
            final_method: None,
            attempts: self.config.max_retries,
            process_was_gone: false,
            error: Some(last_error.unwrap_or_else(|| {
                format!(
                    "process with tag {} still alive after {} attempts",
                    tag, self.config.max_retries
                )
            })),
        }
    }

    /// One walk down the ladder. `Ok(Some(method))` once verified gone.
    async fn pass(
        &self,
        run_id: Option<&str>,
        tag: &str,
        kind: Option<RunnerKind>,
    ) -> Result<Option<TerminationMethod>> {
        if let (Some(run_id), Some(runner)) = (run_id, kind.and_then(|k| self.runners.get(k))) {
            match runner.stop(run_id).await {
                Ok(()) => {
                    if self.verify_gone(tag).await? {
                        return Ok(Some(TerminationMethod::RunnerStop));
                    }
                }
                Err(e) => {
                    tracing::debug!(run_id, error = %format!("{:#}", e), "Runner stop failed");
                }
            }
        }

        if self.config.cli_fallback
            && let Some(kind) = kind
        {
            let args = vec!["agents".to_string(), "stop".to_string(), tag.to_string()];
            match self.probe.run_command(&kind.resource_cli(), &args).await {
                Ok(true) => {
                    if self.verify_gone(tag).await? {
                        return Ok(Some(TerminationMethod::CliStop));
                    }
                }
                Ok(false) => tracing::debug!(tag, "CLI stop fallback did not succeed"),
                Err(e) => tracing::debug!(tag, error = %format!("{:#}", e), "CLI stop fallback failed"),
            }
        }

        let pids = self.probe.find_by_tag(tag).await?;
        if pids.is_empty() {
            return Ok(Some(TerminationMethod::AlreadyGone));
        }
        // Read groups before signalling; a dead leader has no stat.
        let mut groups = Vec::new();
        if self.config.kill_process_group {
            for pid in &pids {
                if let Some(pgid) = self.probe.process_group(*pid).await?
                    && !groups.contains(&pgid)
                {
                    groups.push(pgid);
                }
            }
        }

        for pid in &pids {
            self.probe.signal(*pid, Signal::Term).await?;
        }
        tokio::time::sleep(self.config.grace_period).await;
        if self.verify_gone(tag).await? {
            return Ok(Some(TerminationMethod::Sigterm));
        }

        for pid in &pids {
            self.probe.signal(*pid, Signal::Kill).await?;
        }
        tokio::time::sleep(KILL_SETTLE).await;
        if self.verify_gone(tag).await? {
            return Ok(Some(TerminationMethod::Sigkill));
        }

        if self.config.kill_process_group {
            for pgid in &groups {
                if let Err(e) = self.probe.signal_group(*pgid, Signal::Kill).await {
                    tracing::warn!(pgid, error = %format!("{:#}", e), "Process group kill failed");
                }
            }
            if self.verify_gone(tag).await? {
                return Ok(Some(TerminationMethod::ProcessGroupKill));
            }
        }
        Ok(None)
    }

    /// Re-scan for the tag until it is gone or `verify_timeout` passes.
    async fn verify_gone(&self, tag: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.config.verify_timeout;
        loop {
            if self.probe.find_by_tag(tag).await?.is_empty() {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(VERIFY_POLL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FakeProcessProbe;

    fn fast_config() -> TerminatorConfig {
        TerminatorConfig::default()
            .with_grace_period(Duration::from_millis(5))
            .with_verify_timeout(Duration::from_millis(5))
            .with_base_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = TerminatorConfig::default()
            .with_base_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350));
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_already_gone_succeeds_in_one_attempt() {
        let probe = Arc::new(FakeProcessProbe::new());
        let terminator = Terminator::new(fast_config(), probe.clone(), RunnerRegistry::new());
        let outcome = terminator.terminate_tag("run-x", Some(RunnerKind::Claude)).await;
        assert!(outcome.success);
        assert!(outcome.process_was_gone);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.final_method, Some(TerminationMethod::AlreadyGone));
        assert!(probe.signals().is_empty());
    }

    #[tokio::test]
    async fn test_cli_fallback_is_tried_before_signals() {
        let probe = Arc::new(FakeProcessProbe::new());
        probe.spawn_tagged(100, "run-x", chrono::Duration::minutes(1));
        probe.set_stop_command_works(true);
        let terminator = Terminator::new(fast_config(), probe.clone(), RunnerRegistry::new());

        let outcome = terminator.terminate_tag("run-x", Some(RunnerKind::Codex)).await;
        assert_eq!(outcome.final_method, Some(TerminationMethod::CliStop));
        assert_eq!(probe.commands(), vec!["resource-codex agents stop run-x".to_string()]);
        assert!(probe.signals().is_empty());
    }

    #[tokio::test]
    async fn test_sigterm_when_no_kind_known() {
        let probe = Arc::new(FakeProcessProbe::new());
        probe.spawn_tagged(100, "run-x", chrono::Duration::minutes(1));
        let terminator = Terminator::new(fast_config(), probe.clone(), RunnerRegistry::new());

        let outcome = terminator.terminate_tag("run-x", None).await;
        assert!(outcome.success);
        assert!(!outcome.process_was_gone);
        assert_eq!(outcome.final_method, Some(TerminationMethod::Sigterm));
        assert!(probe.commands().is_empty());
    }

    #[tokio::test]
    async fn test_escalates_to_sigkill() {
        let probe = Arc::new(FakeProcessProbe::new());
        probe.spawn_tagged(100, "run-x", chrono::Duration::minutes(1));
        probe.ignore_term(100);
        let terminator = Terminator::new(
            fast_config().with_cli_fallback(false),
            probe.clone(),
            RunnerRegistry::new(),
        );

        let outcome = terminator.terminate_tag("run-x", Some(RunnerKind::Claude)).await;
        assert_eq!(outcome.final_method, Some(TerminationMethod::Sigkill));
        assert_eq!(
            probe.signals(),
            vec![(100, Signal::Term), (100, Signal::Kill)]
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_group_kill() {
        let probe = Arc::new(FakeProcessProbe::new());
        probe.spawn_tagged(100, "run-x", chrono::Duration::minutes(1));
        probe.ignore_direct_signals(100);
        let terminator = Terminator::new(fast_config(), probe.clone(), RunnerRegistry::new());

        let outcome = terminator.terminate_tag("run-x", None).await;
        assert_eq!(outcome.final_method, Some(TerminationMethod::ProcessGroupKill));
        assert!(!probe.is_alive(100));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let probe = Arc::new(FakeProcessProbe::new());
        probe.spawn_tagged(100, "run-x", chrono::Duration::minutes(1));
        probe.ignore_direct_signals(100);
        let terminator = Terminator::new(
            fast_config().with_kill_process_group(false).with_max_retries(2),
            probe.clone(),
            RunnerRegistry::new(),
        );

        let outcome = terminator.terminate_tag("run-x", None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("still alive"));
        assert!(probe.is_alive(100));
    }
}
