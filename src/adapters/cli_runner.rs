//! Runner backed by an agent CLI child process.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::runner::{ExecuteRequest, ExecuteResult, Runner, RunnerCapabilities};
use super::stream::OutputParser;
use crate::domain::{AgentProfile, EventPayload, RunnerKind};
use crate::util::truncate_chars;

const STOP_GRACE: Duration = Duration::from_secs(3);
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CliRunnerConfig {
    pub kind: RunnerKind,
    pub command: String,
    pub args: Vec<String>,
    /// Flag placed before the run tag, e.g. `--tag`.
    pub tag_flag: String,
    pub env: BTreeMap<String, String>,
}

impl CliRunnerConfig {
    pub fn new(kind: RunnerKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            args: Vec::new(),
            tag_flag: "--tag".to_string(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Full argument list for one execution.
    pub fn build_args(&self, tag: &str, profile: &AgentProfile) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(self.tag_flag.clone());
        args.push(tag.to_string());
        if !profile.model.is_empty() {
            args.push("--model".to_string());
            args.push(profile.model.clone());
        }
        if self.kind == RunnerKind::Claude && profile.max_turns > 0 {
            args.push("--max-turns".to_string());
            args.push(profile.max_turns.to_string());
        }
        args
    }
}

pub struct CliRunner {
    config: CliRunnerConfig,
    running: Arc<Mutex<HashMap<String, Child>>>,
}

impl CliRunner {
    pub fn new(config: CliRunnerConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

#[async_trait]
impl Runner for CliRunner {
    fn kind(&self) -> RunnerKind {
        self.config.kind
    }

    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities {
            streams_events: true,
            supports_stop: true,
            supports_max_turns: self.config.kind == RunnerKind::Claude,
        }
    }

    async fn is_available(&self) -> (bool, String) {
        match find_executable(&self.config.command) {
            Some(path) => (true, format!("{} found at {}", self.config.command, path.display())),
            None => (false, format!("{} not found on PATH", self.config.command)),
        }
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        let ExecuteRequest {
            run_id,
            tag,
            prompt,
            work_dir,
            profile,
            events,
        } = request;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.build_args(&tag, &profile))
            .envs(&self.config.env)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.command))?;
        tracing::info!(
            run_id = %run_id,
            tag = %tag,
            pid = child.id(),
            command = %self.config.command,
            "Runner process started"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.running.lock().await.insert(run_id.clone(), child);

        if let Some(mut stdin) = stdin {
            // The child may exit without reading; that is its business.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!(run_id = %run_id, error = %e, "Failed to write prompt to runner");
            }
            drop(stdin);
        }

        let stderr_task = tokio::spawn(async move {
            let mut content = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    content.push_str(&line);
                    content.push('\n');
                }
            }
            content
        });

        let mut parser = OutputParser::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for payload in parser.parse_line(&line) {
                    events.emit(payload);
                }
            }
        }
        let stderr_content = stderr_task.await.unwrap_or_default();

        // Drop the guard before waiting on the child.
        let child = self.running.lock().await.remove(&run_id);
        let Some(mut child) = child else {
            tracing::info!(run_id = %run_id, "Runner process was stopped");
            return Ok(ExecuteResult {
                exit_code: -1,
                summary: Some(parser.summary()),
                error: Some("runner stopped".to_string()),
            });
        };
        let status = child.wait().await.context("Failed to wait for runner")?;
        let exit_code = status.code().unwrap_or(-1);

        let error = if let Some(reported) = parser.reported_error() {
            Some(reported.to_string())
        } else if status.success() {
            None
        } else if stderr_content.trim().is_empty() {
            Some(format!("runner exited with status {}", exit_code))
        } else {
            Some(format!(
                "runner failed: {}",
                truncate_chars(stderr_content.trim(), MAX_STDERR_CHARS)
            ))
        };
        if let Some(message) = &error {
            events.emit(EventPayload::Error {
                code: "runner_exit".to_string(),
                message: message.clone(),
            });
        }

        tracing::info!(run_id = %run_id, exit_code, "Runner process finished");
        Ok(ExecuteResult {
            exit_code,
            summary: Some(parser.summary()),
            error,
        })
    }

    async fn stop(&self, run_id: &str) -> Result<()> {
        let child = self.running.lock().await.remove(run_id);
        let Some(mut child) = child else {
            return Ok(());
        };
        let pid = child.id();
        signal_group(pid, libc::SIGTERM);
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(_)) => {
                // Reap stragglers that share the group.
                signal_group(pid, libc::SIGKILL);
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("Failed to wait for stopped runner"),
            Err(_) => {
                tracing::warn!(run_id, "Runner ignored SIGTERM; killing");
                signal_group(pid, libc::SIGKILL);
                child.kill().await.context("Failed to kill runner")
            }
        }
    }
}

/// Signal the process group led by `pid` (children are spawned as group
/// leaders).
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only targets the group we created.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Resolve `command` the way a shell would: as a path if it has a
/// separator, otherwise through `PATH`.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = Path::new(command);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::events::EventSink;
    use crate::domain::RunnerKind;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CollectingSink(StdMutex<Vec<EventPayload>>);

    #[async_trait]
    impl EventSink for CollectingSink {
        fn emit(&self, payload: EventPayload) {
            self.0.lock().unwrap().push(payload);
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn profile() -> AgentProfile {
        let now = chrono::Utc::now();
        AgentProfile {
            id: "p1".into(),
            name: "default".into(),
            runner_kind: RunnerKind::Claude,
            model: "sonnet".into(),
            max_turns: 5,
            requires_sandbox: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn shell_runner(script: &str) -> CliRunner {
        CliRunner::new(CliRunnerConfig::new(RunnerKind::Claude, "sh").with_args(["-c", script]))
    }

    fn request(sink: Arc<CollectingSink>, dir: &Path) -> ExecuteRequest {
        ExecuteRequest {
            run_id: "run-1".into(),
            tag: "run-1".into(),
            prompt: "do the thing".into(),
            work_dir: dir.to_path_buf(),
            profile: profile(),
            events: sink,
        }
    }

    #[test]
    fn test_build_args_appends_tag_and_profile_flags() {
        let config = CliRunnerConfig::new(RunnerKind::Claude, "claude").with_args(["--print"]);
        let args = config.build_args("run-abc", &profile());
        assert_eq!(
            args,
            vec!["--print", "--tag", "run-abc", "--model", "sonnet", "--max-turns", "5"]
        );

        let codex = CliRunnerConfig::new(RunnerKind::Codex, "codex");
        assert!(!codex.build_args("t", &profile()).contains(&"--max-turns".to_string()));
    }

    #[test]
    fn test_find_executable() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-xyz").is_none());
        assert!(find_executable("/nonexistent/bin/tool").is_none());
    }

    #[tokio::test]
    async fn test_execute_streams_events_and_summary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = shell_runner(
            r#"cat >/dev/null; echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'; echo '{"type":"result","subtype":"success","result":"all done","is_error":false}'"#,
        );
        let sink = Arc::new(CollectingSink::default());
        let result = runner.execute(request(sink.clone(), dir.path())).await?;

        assert_eq!(result.exit_code, 0);
        assert!(result.succeeded());
        assert_eq!(result.summary.unwrap().description, "all done");
        let events = sink.0.lock().unwrap().clone();
        assert_eq!(events, vec![EventPayload::assistant("working")]);
        assert_eq!(runner.running_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_reports_nonzero_exit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = shell_runner("echo boom >&2; exit 3");
        let sink = Arc::new(CollectingSink::default());
        let result = runner.execute(request(sink.clone(), dir.path())).await?;

        assert_eq!(result.exit_code, 3);
        assert!(result.error.unwrap().contains("boom"));
        assert!(matches!(
            sink.0.lock().unwrap().last(),
            Some(EventPayload::Error { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_terminates_running_child() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(shell_runner("sleep 30"));
        let sink = Arc::new(CollectingSink::default());
        let req = request(sink, dir.path());

        let exec_runner = runner.clone();
        let handle = tokio::spawn(async move { exec_runner.execute(req).await });
        for _ in 0..50 {
            if runner.running_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        runner.stop("run-1").await?;

        let result = tokio::time::timeout(Duration::from_secs(10), handle).await???;
        assert_ne!(result.exit_code, 0);
        assert!(result.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_is_available_reports_missing_command() {
        let runner = CliRunner::new(CliRunnerConfig::new(RunnerKind::Codex, "no-such-agent-cli"));
        let (ok, reason) = runner.is_available().await;
        assert!(!ok);
        assert!(reason.contains("not found"));
    }
}
