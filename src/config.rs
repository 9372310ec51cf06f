//! Configuration for the agent manager.
//!
//! Reads `.agent-manager/config.toml`. Every field has a default, so an
//! empty or missing file yields a working setup.
//!
//! Layering: file → environment → CLI flags.
//!
//! ```toml
//! [orchestrator]
//! default_timeout_secs = 1800
//! max_concurrent_runs = 4
//! require_sandbox_by_default = true
//!
//! [executor]
//! heartbeat_interval_secs = 30
//! checkpoint_interval_secs = 60
//! stale_threshold_secs = 120
//!
//! [reconciler]
//! interval_secs = 30
//! kill_orphans = false
//! auto_recover = false
//!
//! [terminator]
//! grace_period_ms = 5000
//! kill_process_group = true
//!
//! [recommendations]
//! max_retries = 3
//! retry_backoff_secs = 60
//!
//! [[recommendations.allowlist]]
//! pattern = "agent-manager-investigation"
//!
//! [runners.claude]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//!
//! [extractor]
//! enabled = true
//! model = "llama3.1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::cli_runner::CliRunnerConfig;
use crate::adapters::extractor::OllamaConfig;
use crate::adapters::sandbox::WorktreeConfig;
use crate::domain::{AllowlistRule, INVESTIGATION_TAG_PREFIX, RunnerKind};
use crate::executor::ExecutorConfig;
use crate::logging::LoggingConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::reconciler::ReconcilerConfig;
use crate::recommendations::WorkerConfig;
use crate::terminator::TerminatorConfig;

/// Directory holding config, database, logs and sandboxes.
pub const STATE_DIR: &str = ".agent-manager";
pub const CONFIG_FILE: &str = "config.toml";
pub const DB_FILE: &str = "agent-manager.db";

// ── [orchestrator] ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_run_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Used when a task is created without a project root.
    #[serde(default)]
    pub default_project_root: Option<String>,
    #[serde(default = "default_true")]
    pub require_sandbox_by_default: bool,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

fn default_run_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_idempotency_ttl_secs() -> u64 {
    60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_run_timeout_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            default_project_root: None,
            require_sandbox_by_default: true,
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
        }
    }
}

// ── [executor] ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Overrides `orchestrator.default_timeout_secs` when set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_stale_threshold_secs() -> u64 {
    120
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_retries: default_max_retries(),
            stale_threshold_secs: default_stale_threshold_secs(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

// ── [reconciler] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_orphan_grace_period_secs")]
    pub orphan_grace_period_secs: u64,
    #[serde(default = "default_max_stale_runs")]
    pub max_stale_runs: usize,
    #[serde(default)]
    pub kill_orphans: bool,
    #[serde(default)]
    pub auto_recover: bool,
    /// Search terms used to list agent processes.
    #[serde(default = "default_agent_terms")]
    pub agent_terms: Vec<String>,
}

fn default_loop_interval_secs() -> u64 {
    30
}

fn default_orphan_grace_period_secs() -> u64 {
    5 * 60
}

fn default_max_stale_runs() -> usize {
    50
}

fn default_agent_terms() -> Vec<String> {
    RunnerKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_loop_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            orphan_grace_period_secs: default_orphan_grace_period_secs(),
            max_stale_runs: default_max_stale_runs(),
            kill_orphans: false,
            auto_recover: false,
            agent_terms: default_agent_terms(),
        }
    }
}

// ── [terminator] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatorSection {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub kill_process_group: bool,
    #[serde(default = "default_true")]
    pub cli_fallback: bool,
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_verify_timeout_ms() -> u64 {
    2_000
}

impl Default for TerminatorSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            kill_process_group: true,
            cli_fallback: true,
        }
    }
}

// ── [recommendations] ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_concurrent_extractions")]
    pub max_concurrent: usize,
    #[serde(default = "default_extraction_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<AllowlistRule>,
}

fn default_retry_backoff_secs() -> u64 {
    60
}

fn default_max_concurrent_extractions() -> usize {
    1
}

fn default_extraction_stale_timeout_secs() -> u64 {
    5 * 60
}

fn default_extraction_timeout_secs() -> u64 {
    120
}

fn default_max_text_length() -> usize {
    10_000
}

fn default_allowlist() -> Vec<AllowlistRule> {
    vec![AllowlistRule::literal(INVESTIGATION_TAG_PREFIX)]
}

impl Default for RecommendationsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_loop_interval_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_concurrent: default_max_concurrent_extractions(),
            stale_timeout_secs: default_extraction_stale_timeout_secs(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            max_text_length: default_max_text_length(),
            allowlist: default_allowlist(),
        }
    }
}

// ── [database] [sandbox] [extractor] [runners.*] ──────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Defaults to `.agent-manager/agent-manager.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `.agent-manager/sandboxes`.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_branch_prefix() -> String {
    "agent-manager/".to_string()
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_extractor_url")]
    pub url: String,
    #[serde(default = "default_extractor_model")]
    pub model: String,
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_extractor_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_extractor_model() -> String {
    "llama3.1".to_string()
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_extractor_url(),
            model: default_extractor_model(),
            timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

/// Command line for one runner kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag placed before the run tag.
    #[serde(default = "default_tag_flag")]
    pub tag_flag: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_tag_flag() -> String {
    "--tag".to_string()
}

fn default_runners() -> BTreeMap<String, RunnerSection> {
    let mut runners = BTreeMap::new();
    runners.insert(
        RunnerKind::Claude.as_str().to_string(),
        RunnerSection {
            enabled: true,
            command: "claude".to_string(),
            args: ["--print", "--output-format", "stream-json", "--verbose"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tag_flag: default_tag_flag(),
            env: BTreeMap::new(),
        },
    );
    runners
}

// ── Root ──────────────────────────────────────────────────────────────

/// Parsed `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
    #[serde(default)]
    pub terminator: TerminatorSection,
    #[serde(default)]
    pub recommendations: RecommendationsSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_runners")]
    pub runners: BTreeMap<String, RunnerSection>,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub extractor: ExtractorSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSection::default(),
            executor: ExecutorSection::default(),
            reconciler: ReconcilerSection::default(),
            terminator: TerminatorSection::default(),
            recommendations: RecommendationsSection::default(),
            database: DatabaseSection::default(),
            logging: LoggingConfig::default(),
            runners: default_runners(),
            sandbox: SandboxSection::default(),
            extractor: ExtractorSection::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load from `<state_dir>/config.toml`, or defaults if the file is absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("AGENT_MANAGER_DB")
            && !db.is_empty()
        {
            self.database.path = Some(db);
        }
        if let Ok(level) = std::env::var("AGENT_MANAGER_LOG")
            && !level.is_empty()
        {
            self.logging.level = level;
        }
        if let Ok(val) = std::env::var("AGENT_MANAGER_KILL_ORPHANS") {
            self.reconciler.kill_orphans = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_concurrent_runs == 0 {
            warnings.push("orchestrator.max_concurrent_runs is 0: no run will ever start".into());
        }
        if self.executor.heartbeat_interval_secs == 0 {
            warnings.push("executor.heartbeat_interval_secs must be greater than 0".into());
        }
        if self.executor.heartbeat_interval_secs >= self.executor.stale_threshold_secs {
            warnings.push(format!(
                "executor.heartbeat_interval_secs ({}) should be below stale_threshold_secs ({})",
                self.executor.heartbeat_interval_secs, self.executor.stale_threshold_secs
            ));
        }
        if self.executor.heartbeat_interval_secs >= self.reconciler.stale_threshold_secs {
            warnings.push(format!(
                "executor.heartbeat_interval_secs ({}) should be below reconciler.stale_threshold_secs ({})",
                self.executor.heartbeat_interval_secs, self.reconciler.stale_threshold_secs
            ));
        }
        if self.reconciler.interval_secs == 0 {
            warnings.push("reconciler.interval_secs must be greater than 0".into());
        }
        if self.terminator.max_retries == 0 {
            warnings.push("terminator.max_retries is 0: termination will never be attempted".into());
        }
        if self.terminator.base_backoff_ms > self.terminator.max_backoff_ms {
            warnings.push("terminator.base_backoff_ms exceeds max_backoff_ms".into());
        }
        if self.recommendations.interval_secs == 0 {
            warnings.push("recommendations.interval_secs must be greater than 0".into());
        }
        if self.recommendations.max_retries == 0 {
            warnings.push("recommendations.max_retries is 0: extractions fail without an attempt".into());
        }
        if self.recommendations.max_concurrent == 0 {
            warnings.push("recommendations.max_concurrent is 0: the queue will never drain".into());
        }
        for rule in &self.recommendations.allowlist {
            if rule.is_regex && regex::Regex::new(&rule.pattern).is_err() {
                warnings.push(format!("Invalid allowlist regex '{}'", rule.pattern));
            }
        }
        for name in self.runners.keys() {
            if name.parse::<RunnerKind>().is_err() {
                warnings.push(format!("Unknown runner kind '{}' in [runners]", name));
            }
        }

        warnings
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let section = &self.orchestrator;
        OrchestratorConfig::default()
            .with_default_timeout(Duration::from_secs(section.default_timeout_secs))
            .with_max_concurrent_runs(section.max_concurrent_runs)
            .with_default_project_root(section.default_project_root.as_ref().map(PathBuf::from))
            .with_require_sandbox_by_default(section.require_sandbox_by_default)
            .with_idempotency_ttl(Duration::from_secs(section.idempotency_ttl_secs))
            .with_executor(self.executor_config())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let section = &self.executor;
        let timeout = section
            .timeout_secs
            .unwrap_or(self.orchestrator.default_timeout_secs);
        ExecutorConfig::default()
            .with_timeout(Duration::from_secs(timeout))
            .with_heartbeat_interval(Duration::from_secs(section.heartbeat_interval_secs))
            .with_checkpoint_interval(Duration::from_secs(section.checkpoint_interval_secs))
            .with_max_retries(section.max_retries)
            .with_stale_threshold(Duration::from_secs(section.stale_threshold_secs))
            .with_stop_grace(Duration::from_millis(section.stop_grace_ms))
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let section = &self.reconciler;
        ReconcilerConfig::default()
            .with_interval(Duration::from_secs(section.interval_secs))
            .with_stale_threshold(Duration::from_secs(section.stale_threshold_secs))
            .with_orphan_grace_period(Duration::from_secs(section.orphan_grace_period_secs))
            .with_max_stale_runs(section.max_stale_runs)
            .with_kill_orphans(section.kill_orphans)
            .with_auto_recover(section.auto_recover)
            .with_agent_terms(section.agent_terms.clone())
            .with_allowlist(self.recommendations.allowlist.clone())
    }

    pub fn terminator_config(&self) -> TerminatorConfig {
        let section = &self.terminator;
        TerminatorConfig::default()
            .with_grace_period(Duration::from_millis(section.grace_period_ms))
            .with_max_retries(section.max_retries)
            .with_base_backoff(Duration::from_millis(section.base_backoff_ms))
            .with_max_backoff(Duration::from_millis(section.max_backoff_ms))
            .with_verify_timeout(Duration::from_millis(section.verify_timeout_ms))
            .with_kill_process_group(section.kill_process_group)
            .with_cli_fallback(section.cli_fallback)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let section = &self.recommendations;
        WorkerConfig::default()
            .with_interval(Duration::from_secs(section.interval_secs))
            .with_max_retries(section.max_retries)
            .with_retry_backoff(Duration::from_secs(section.retry_backoff_secs))
            .with_max_concurrent(section.max_concurrent)
            .with_stale_timeout(Duration::from_secs(section.stale_timeout_secs))
            .with_extraction_timeout(Duration::from_secs(section.extraction_timeout_secs))
            .with_max_text_length(section.max_text_length)
            .with_allowlist(section.allowlist.clone())
    }

    /// Runner command lines for every enabled, recognized kind.
    pub fn runner_configs(&self) -> Vec<CliRunnerConfig> {
        self.runners
            .iter()
            .filter(|(_, section)| section.enabled)
            .filter_map(|(name, section)| {
                let kind = name.parse::<RunnerKind>().ok()?;
                Some(CliRunnerConfig {
                    kind,
                    command: section.command.clone(),
                    args: section.args.clone(),
                    tag_flag: section.tag_flag.clone(),
                    env: section.env.clone(),
                })
            })
            .collect()
    }

    pub fn extractor_config(&self) -> Option<OllamaConfig> {
        if !self.extractor.enabled {
            return None;
        }
        Some(OllamaConfig {
            base_url: self.extractor.url.clone(),
            model: self.extractor.model.clone(),
            timeout: Duration::from_secs(self.extractor.timeout_secs),
        })
    }
}

/// `~/.config/agent-manager/config.toml`, read when the project has none.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agent-manager").join(CONFIG_FILE))
}

/// Resolved project directories plus the parsed file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub file: AppConfig,
}

impl Settings {
    /// Load settings for a project directory, applying environment overrides.
    /// An explicit `config_path` replaces `<project>/.agent-manager/config.toml`.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut file = match config_path {
            Some(path) => AppConfig::load(path)?,
            None if state_dir.join(CONFIG_FILE).exists() => AppConfig::load_or_default(&state_dir)?,
            None => match user_config_path().filter(|p| p.exists()) {
                Some(path) => AppConfig::load(&path)?,
                None => AppConfig::default(),
            },
        };
        file.apply_env();
        Ok(Self {
            project_dir,
            state_dir,
            file,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.file.database.path {
            Some(path) => self.resolve(path),
            None => self.state_dir.join(DB_FILE),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.file.logging.dir {
            Some(dir) => self.resolve(dir),
            None => self.state_dir.join("logs"),
        }
    }

    pub fn sandbox_config(&self) -> WorktreeConfig {
        let root = match &self.file.sandbox.root {
            Some(root) => self.resolve(root),
            None => self.state_dir.join("sandboxes"),
        };
        WorktreeConfig {
            root,
            branch_prefix: self.file.sandbox.branch_prefix.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = self.file.orchestrator_config();
        if config.default_project_root.is_none() {
            config.default_project_root = Some(self.project_dir.clone());
        }
        config
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.orchestrator.max_concurrent_runs, 4);
        assert!(config.orchestrator.require_sandbox_by_default);
        assert_eq!(config.executor.heartbeat_interval_secs, 30);
        assert_eq!(config.executor.checkpoint_interval_secs, 60);
        assert_eq!(config.executor.stale_threshold_secs, 120);
        assert!(!config.reconciler.kill_orphans);
        assert!(!config.reconciler.auto_recover);
        assert_eq!(config.reconciler.orphan_grace_period_secs, 300);
        assert_eq!(config.recommendations.max_concurrent, 1);
        assert_eq!(config.recommendations.allowlist.len(), 1);
        assert!(config.runners.contains_key("claude"));
        assert!(!config.extractor.enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_sections() {
        let toml = r#"
[orchestrator]
max_concurrent_runs = 2
require_sandbox_by_default = false

[executor]
timeout_secs = 600
heartbeat_interval_secs = 5

[reconciler]
kill_orphans = true
agent_terms = ["claude"]

[terminator]
grace_period_ms = 100
kill_process_group = false

[recommendations]
retry_backoff_secs = 2

[[recommendations.allowlist]]
pattern = "^special-.*"
is_regex = true
case_sensitive = true

[runners.codex]
command = "codex"
args = ["exec", "--json"]

[extractor]
enabled = true
model = "qwen"
"#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.orchestrator.max_concurrent_runs, 2);
        assert_eq!(config.executor.timeout_secs, Some(600));
        assert!(config.reconciler.kill_orphans);
        assert_eq!(config.reconciler.agent_terms, vec!["claude".to_string()]);
        assert!(!config.terminator.kill_process_group);
        assert!(config.recommendations.allowlist[0].is_regex);

        // Declaring [runners] replaces the default table.
        let runners = config.runner_configs();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].kind, RunnerKind::Codex);

        let extractor = config.extractor_config().unwrap();
        assert_eq!(extractor.model, "qwen");
    }

    #[test]
    fn test_executor_timeout_falls_back_to_orchestrator_default() {
        let config = AppConfig::parse("[orchestrator]\ndefault_timeout_secs = 90\n").unwrap();
        assert_eq!(config.executor_config().timeout, Duration::from_secs(90));

        let config = AppConfig::parse(
            "[orchestrator]\ndefault_timeout_secs = 90\n[executor]\ntimeout_secs = 10\n",
        )
        .unwrap();
        assert_eq!(config.executor_config().timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_runtime_configs_carry_section_values() {
        let config = AppConfig::parse(
            "[reconciler]\ninterval_secs = 7\nmax_stale_runs = 3\n[terminator]\nmax_backoff_ms = 900\n",
        )
        .unwrap();
        let reconciler = config.reconciler_config();
        assert_eq!(reconciler.interval, Duration::from_secs(7));
        assert_eq!(reconciler.max_stale_runs, 3);
        assert_eq!(config.terminator_config().max_backoff, Duration::from_millis(900));
        assert_eq!(config.worker_config().max_text_length, 10_000);
    }

    #[test]
    fn test_validate_reports_problems() {
        let toml = r#"
[executor]
heartbeat_interval_secs = 200

[recommendations]
max_retries = 0

[[recommendations.allowlist]]
pattern = "(broken"
is_regex = true

[runners.gemini]
command = "gemini"
"#;
        let warnings = AppConfig::parse(toml).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("heartbeat_interval_secs")));
        assert!(warnings.iter().any(|w| w.contains("max_retries is 0")));
        assert!(warnings.iter().any(|w| w.contains("(broken")));
        assert!(warnings.iter().any(|w| w.contains("gemini")));
    }

    #[test]
    fn test_parse_invalid_toml_errors() {
        assert!(AppConfig::parse("[orchestrator\nmax = ").is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = AppConfig::default();
        config.reconciler.auto_recover = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert!(loaded.reconciler.auto_recover);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved_db = std::env::var("AGENT_MANAGER_DB").ok();
        let saved_kill = std::env::var("AGENT_MANAGER_KILL_ORPHANS").ok();

        unsafe {
            std::env::set_var("AGENT_MANAGER_DB", "/tmp/custom.db");
            std::env::set_var("AGENT_MANAGER_KILL_ORPHANS", "true");
        }
        let mut config = AppConfig::default();
        config.apply_env();
        assert_eq!(config.database.path.as_deref(), Some("/tmp/custom.db"));
        assert!(config.reconciler.kill_orphans);

        unsafe {
            match saved_db {
                Some(val) => std::env::set_var("AGENT_MANAGER_DB", val),
                None => std::env::remove_var("AGENT_MANAGER_DB"),
            }
            match saved_kill {
                Some(val) => std::env::set_var("AGENT_MANAGER_KILL_ORPHANS", val),
                None => std::env::remove_var("AGENT_MANAGER_KILL_ORPHANS"),
            }
        }
    }

    #[test]
    fn test_settings_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path(), None).unwrap();
        if std::env::var("AGENT_MANAGER_DB").is_err() {
            assert!(settings.db_path().ends_with(".agent-manager/agent-manager.db"));
        }
        assert!(settings.sandbox_config().root.ends_with(".agent-manager/sandboxes"));
        assert_eq!(
            settings.orchestrator_config().default_project_root,
            Some(settings.project_dir.clone())
        );
    }
}
