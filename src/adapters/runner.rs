//! The runner seam: something that can execute an agent against a working
//! directory and stream events back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::events::EventSink;
use crate::domain::{AgentProfile, RunSummary, RunnerKind};

pub struct ExecuteRequest {
    pub run_id: String,
    /// Embedded in the runner's command line so the process can be found
    /// again after a restart.
    pub tag: String,
    pub prompt: String,
    pub work_dir: PathBuf,
    pub profile: AgentProfile,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub exit_code: i32,
    pub summary: Option<RunSummary>,
    /// Set when the agent itself reported a failure.
    pub error: Option<String>,
}

impl ExecuteResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RunnerCapabilities {
    pub streams_events: bool,
    pub supports_stop: bool,
    pub supports_max_turns: bool,
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    fn capabilities(&self) -> RunnerCapabilities;

    /// Whether the runner can be started here, with a human readable reason.
    async fn is_available(&self) -> (bool, String);

    /// Run the agent to completion. An `Err` means the runner itself broke;
    /// an agent that ran and failed reports through [`ExecuteResult`].
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult>;

    /// Stop the execution started for `run_id`. No-op if it is not running.
    async fn stop(&self, run_id: &str) -> Result<()>;
}

/// Runners keyed by kind.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<RunnerKind, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, runner: Arc<dyn Runner>) -> Self {
        self.register(runner);
        self
    }

    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.kind(), runner);
    }

    pub fn get(&self, kind: RunnerKind) -> Option<Arc<dyn Runner>> {
        self.runners.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<RunnerKind> {
        let mut kinds: Vec<RunnerKind> = self.runners.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRunner(RunnerKind);

    #[async_trait]
    impl Runner for StubRunner {
        fn kind(&self) -> RunnerKind {
            self.0
        }
        fn capabilities(&self) -> RunnerCapabilities {
            RunnerCapabilities {
                streams_events: false,
                supports_stop: false,
                supports_max_turns: false,
            }
        }
        async fn is_available(&self) -> (bool, String) {
            (true, "stub".into())
        }
        async fn execute(&self, _request: ExecuteRequest) -> Result<ExecuteResult> {
            Ok(ExecuteResult::default())
        }
        async fn stop(&self, _run_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup_by_kind() {
        let registry = RunnerRegistry::new()
            .with(Arc::new(StubRunner(RunnerKind::Codex)))
            .with(Arc::new(StubRunner(RunnerKind::Claude)));
        assert!(registry.get(RunnerKind::Claude).is_some());
        assert!(registry.get(RunnerKind::Opencode).is_none());
        assert_eq!(registry.kinds(), vec![RunnerKind::Claude, RunnerKind::Codex]);
    }

    #[test]
    fn test_execute_result_success() {
        assert!(ExecuteResult::default().succeeded());
        let failed = ExecuteResult {
            exit_code: 0,
            error: Some("max turns".into()),
            ..Default::default()
        };
        assert!(!failed.succeeded());
    }
}
