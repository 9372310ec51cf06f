use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Task ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// User-declared unit of work. The description seeds the runner prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Filesystem prefix the runner may touch.
    pub scope_path: String,
    pub project_root: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating or updating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub title: String,
    pub description: String,
    pub scope_path: String,
    pub project_root: String,
}

// ── Profile ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Claude,
    Codex,
    Opencode,
}

impl RunnerKind {
    pub const ALL: [RunnerKind; 3] = [RunnerKind::Claude, RunnerKind::Codex, RunnerKind::Opencode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }

    /// Name of the resource CLI that can stop agents of this kind.
    pub fn resource_cli(&self) -> String {
        format!("resource-{}", self.as_str())
    }
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claude_code" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::Opencode),
            _ => Err(format!("Invalid runner kind: {}", s)),
        }
    }
}

/// Runner configuration. Immutable while a run references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub runner_kind: RunnerKind,
    pub model: String,
    pub max_turns: u32,
    pub requires_sandbox: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileInput {
    pub name: String,
    pub runner_kind: RunnerKind,
    pub model: String,
    pub max_turns: u32,
    pub requires_sandbox: bool,
}

// ── Run ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Sandboxed,
    InPlace,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandboxed => "sandboxed",
            Self::InPlace => "in_place",
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandboxed" => Ok(Self::Sandboxed),
            "in_place" | "in-place" => Ok(Self::InPlace),
            _ => Err(format!("Invalid run mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Starting,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] = [RunStatus::Complete, RunStatus::Failed, RunStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Statuses that the executor keeps alive with heartbeats.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Position within the Run Executor state machine.
///
/// Declaration order is execution order; `Ord` follows it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Initializing,
    SandboxCreating,
    RunnerAcquiring,
    Executing,
    CollectingResults,
    AwaitingReview,
    Applying,
    Terminal,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::SandboxCreating => "sandbox_creating",
            Self::RunnerAcquiring => "runner_acquiring",
            Self::Executing => "executing",
            Self::CollectingResults => "collecting_results",
            Self::AwaitingReview => "awaiting_review",
            Self::Applying => "applying",
            Self::Terminal => "terminal",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Queued => "Waiting for an execution slot",
            Self::Initializing => "Preparing the run",
            Self::SandboxCreating => "Creating an isolated workspace",
            Self::RunnerAcquiring => "Acquiring an agent runner",
            Self::Executing => "Agent is working",
            Self::CollectingResults => "Collecting results",
            Self::AwaitingReview => "Waiting for change review",
            Self::Applying => "Applying approved changes",
            Self::Terminal => "Finished",
        }
    }

    /// Progress reported when the executor enters this phase.
    pub fn progress_percent(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Initializing => 5,
            Self::SandboxCreating => 15,
            Self::RunnerAcquiring => 25,
            Self::Executing => 50,
            Self::CollectingResults => 85,
            Self::AwaitingReview => 95,
            Self::Applying => 97,
            Self::Terminal => 100,
        }
    }

    pub fn current_action(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Initializing => "Initializing run",
            Self::SandboxCreating => "Setting up sandbox",
            Self::RunnerAcquiring => "Starting agent",
            Self::Executing => "Agent executing task",
            Self::CollectingResults => "Summarizing output",
            Self::AwaitingReview => "Awaiting approval",
            Self::Applying => "Applying changes",
            Self::Terminal => "Done",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "initializing" => Ok(Self::Initializing),
            "sandbox_creating" => Ok(Self::SandboxCreating),
            "runner_acquiring" => Ok(Self::RunnerAcquiring),
            "executing" => Ok(Self::Executing),
            "collecting_results" => Ok(Self::CollectingResults),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "applying" => Ok(Self::Applying),
            "terminal" => Ok(Self::Terminal),
            _ => Err(format!("Invalid run phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    None,
    Pending,
    Approved,
    Rejected,
    Partial,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Partial => "partial",
        }
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "partial" => Ok(Self::Partial),
            _ => Err(format!("Invalid approval state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    None,
    Pending,
    Extracting,
    Complete,
    Failed,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RecommendationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "extracting" => Ok(Self::Extracting),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid recommendation status: {}", s)),
        }
    }
}

/// Snapshot of the profile settings a run was started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedConfig {
    pub runner_kind: RunnerKind,
    pub model: String,
    pub max_turns: u32,
    #[serde(default)]
    pub requires_review: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub description: String,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecommendationCategory {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// Outcome of a recommendation extraction, cached on the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecommendationResult {
    pub success: bool,
    #[serde(default)]
    pub categories: Vec<RecommendationCategory>,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub extracted_from: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Position of a run in the recommendation extraction queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationState {
    pub status: RecommendationStatus,
    pub attempts: u32,
    pub queued_at: Option<DateTime<Utc>>,
    pub result: Option<RecommendationResult>,
    pub error: Option<String>,
}

impl Default for RecommendationState {
    fn default() -> Self {
        Self {
            status: RecommendationStatus::None,
            attempts: 0,
            queued_at: None,
            result: None,
            error: None,
        }
    }
}

/// Single execution attempt of a (Task, Profile) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub profile_id: String,
    pub idempotency_key: Option<String>,
    pub tag: Option<String>,
    pub mode: RunMode,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub progress_percent: u8,
    pub approval_state: ApprovalState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub sandbox_id: Option<String>,
    pub work_dir: Option<String>,
    pub resolved_config: Option<ResolvedConfig>,
    pub error_message: Option<String>,
    pub summary: Option<RunSummary>,
    pub exit_code: Option<i32>,
    pub recommendation: RecommendationState,
}

impl Run {
    /// A fresh run in status pending / phase queued.
    pub fn new(task_id: &str, profile_id: &str, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            profile_id: profile_id.to_string(),
            idempotency_key: None,
            tag: None,
            mode,
            status: RunStatus::Pending,
            phase: RunPhase::Queued,
            progress_percent: 0,
            approval_state: ApprovalState::None,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_heartbeat: None,
            updated_at: now,
            sandbox_id: None,
            work_dir: None,
            resolved_config: None,
            error_message: None,
            summary: None,
            exit_code: None,
            recommendation: RecommendationState::default(),
        }
    }

    /// Tag embedded in the runner command line. Falls back to the run id.
    pub fn effective_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.id)
    }

    /// True when the last heartbeat is older than `threshold`. A live run
    /// that never heartbeated is measured from its start (or creation).
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let reference = self
            .last_heartbeat
            .or(self.started_at)
            .unwrap_or(self.created_at);
        now.signed_duration_since(reference)
            .to_std()
            .map(|elapsed| elapsed > threshold)
            .unwrap_or(false)
    }

    /// Whether an operator may resume this run.
    ///
    /// Either it failed mid-execution and a checkpoint survives, or it is
    /// still marked live but its heartbeat has gone stale.
    pub fn is_resumable(
        &self,
        checkpoint: Option<&RunCheckpoint>,
        stale_threshold: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match self.status {
            RunStatus::Failed => checkpoint.is_some_and(|cp| {
                cp.phase >= RunPhase::Initializing && cp.phase < RunPhase::AwaitingReview
            }),
            RunStatus::Running | RunStatus::Starting => self.is_stale(stale_threshold, now),
            _ => false,
        }
    }
}

/// Most recent phase boundary of a run; overwritten on every advance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub phase: RunPhase,
    pub sandbox_id: Option<String>,
    pub work_dir: Option<String>,
    pub lock_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunCheckpoint {
    pub fn queued(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: RunPhase::Queued,
            sandbox_id: None,
            work_dir: None,
            lock_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Derived progress view for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub phase_description: String,
    pub progress_percent: u8,
    pub last_update: DateTime<Utc>,
    pub elapsed_secs: Option<i64>,
    pub current_action: String,
}

impl RunProgress {
    pub fn from_run(run: &Run, now: DateTime<Utc>) -> Self {
        let elapsed_secs = run.started_at.map(|started| {
            let end = run.ended_at.unwrap_or(now);
            end.signed_duration_since(started).num_seconds().max(0)
        });
        Self {
            run_id: run.id.clone(),
            status: run.status,
            phase: run.phase,
            phase_description: run.phase.description().to_string(),
            progress_percent: run.progress_percent,
            last_update: run.last_heartbeat.unwrap_or(run.updated_at).max(run.updated_at),
            elapsed_secs,
            current_action: run.phase.current_action().to_string(),
        }
    }
}

// ── Idempotency ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Complete,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid idempotency status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ── Events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Assistant,
    User,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    ToolCall,
    ToolResult,
    Status,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Status => "status",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "status" => Ok(Self::Status),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// Payload of a run event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        role: MessageRole,
        content: String,
    },
    ToolCall {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Status {
        old: RunStatus,
        new: RunStatus,
    },
    Error {
        code: String,
        message: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Message { .. } => EventType::Message,
            Self::ToolCall { .. } => EventType::ToolCall,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::Status { .. } => EventType::Status,
            Self::Error { .. } => EventType::Error,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only log entry, sequence-numbered within its run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub run_id: String,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

// ── Investigation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for InvestigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid investigation status: {}", s)),
        }
    }
}

/// Which aspects of the target runs the analysis should cover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisFlags {
    #[serde(default = "default_true")]
    pub errors: bool,
    #[serde(default)]
    pub performance: bool,
    #[serde(default)]
    pub tool_usage: bool,
    #[serde(default)]
    pub prompt_quality: bool,
}

impl Default for AnalysisFlags {
    fn default() -> Self {
        Self {
            errors: true,
            performance: false,
            tool_usage: false,
            prompt_quality: false,
        }
    }
}

/// Which sections the report should contain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportFlags {
    #[serde(default = "default_true")]
    pub summary: bool,
    #[serde(default = "default_true")]
    pub root_cause: bool,
    #[serde(default = "default_true")]
    pub recommendations: bool,
    #[serde(default)]
    pub metrics: bool,
}

impl Default for ReportFlags {
    fn default() -> Self {
        Self {
            summary: true,
            root_cause: true,
            recommendations: true,
            metrics: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvestigationFindings {
    pub report: String,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

/// Meta-run that analyzes other runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub id: String,
    pub run_ids: Vec<String>,
    pub status: InvestigationStatus,
    pub progress: u8,
    pub analysis: AnalysisFlags,
    pub report: ReportFlags,
    pub agent_run_id: Option<String>,
    pub findings: Option<InvestigationFindings>,
    pub source_investigation_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Investigation {
    pub fn new(run_ids: Vec<String>, analysis: AnalysisFlags, report: ReportFlags) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_ids,
            status: InvestigationStatus::Pending,
            progress: 0,
            analysis,
            report,
            agent_run_id: None,
            findings: None,
            source_investigation_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}
