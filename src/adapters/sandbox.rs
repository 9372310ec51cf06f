//! Isolated working copies for sandboxed runs, backed by git worktrees.
//!
//! Each sandbox is a worktree on its own branch under the sandbox root. A
//! small JSON record next to it lets a restarted process find the worktree
//! again from nothing but the sandbox id.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub run_id: String,
    pub project_root: PathBuf,
    pub scope_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxInfo {
    pub id: String,
    /// Directory the runner should work in (the scope inside the worktree).
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SandboxDiff {
    pub files: Vec<String>,
    pub patch: String,
}

impl SandboxDiff {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo>;

    /// Changes made in the sandbox relative to where it was branched.
    async fn get_diff(&self, sandbox_id: &str) -> Result<SandboxDiff>;

    /// Apply sandbox changes to the project. `None` applies everything;
    /// returns the files that were applied.
    async fn apply(&self, sandbox_id: &str, paths: Option<&[String]>) -> Result<Vec<String>>;

    /// Remove the sandbox. Removing an unknown sandbox succeeds.
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeConfig {
    pub root: PathBuf,
    pub branch_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxRecord {
    id: String,
    project_root: PathBuf,
    worktree: PathBuf,
    branch: String,
    scope_path: String,
}

impl SandboxRecord {
    fn work_dir(&self) -> PathBuf {
        let scope = self.scope_path.trim_matches('/');
        if scope.is_empty() || scope == "." {
            return self.worktree.clone();
        }
        let scoped = self.worktree.join(scope);
        if scoped.is_dir() {
            scoped
        } else {
            self.worktree.clone()
        }
    }
}

pub struct WorktreeSandbox {
    config: WorktreeConfig,
}

impl WorktreeSandbox {
    pub fn new(config: WorktreeConfig) -> Self {
        Self { config }
    }

    fn record_path(&self, sandbox_id: &str) -> PathBuf {
        self.config.root.join(format!("{}.json", sandbox_id))
    }

    async fn load_record(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        let path = self.record_path(sandbox_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content).with_context(|| {
                format!("Failed to parse sandbox record {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn require_record(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        self.load_record(sandbox_id)
            .await?
            .with_context(|| format!("Sandbox {} not found", sandbox_id))
    }

    /// Stage everything in the worktree so new files show up in the diff.
    async fn stage_all(&self, record: &SandboxRecord) -> Result<()> {
        git(&record.worktree, &["add", "-A"]).await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for WorktreeSandbox {
    async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo> {
        let id = format!("sbx-{}", request.run_id);
        if let Some(existing) = self.load_record(&id).await?
            && existing.worktree.is_dir()
        {
            return Ok(SandboxInfo {
                work_dir: existing.work_dir(),
                id,
            });
        }

        tokio::fs::create_dir_all(&self.config.root)
            .await
            .with_context(|| format!("Failed to create {}", self.config.root.display()))?;
        let worktree = self.config.root.join(&id);
        let branch = format!("{}{}", self.config.branch_prefix, id);
        let worktree_str = worktree
            .to_str()
            .context("Sandbox path contains invalid UTF-8")?;

        git(
            &request.project_root,
            &["worktree", "add", "-B", &branch, worktree_str, "HEAD"],
        )
        .await
        .context("Git worktree creation failed")?;

        let record = SandboxRecord {
            id: id.clone(),
            project_root: request.project_root.clone(),
            worktree,
            branch,
            scope_path: request.scope_path.clone(),
        };
        tokio::fs::write(self.record_path(&id), serde_json::to_string_pretty(&record)?)
            .await
            .context("Failed to write sandbox record")?;
        tracing::info!(sandbox_id = %id, run_id = %request.run_id, "Sandbox created");

        Ok(SandboxInfo {
            work_dir: record.work_dir(),
            id,
        })
    }

    async fn get_diff(&self, sandbox_id: &str) -> Result<SandboxDiff> {
        let record = self.require_record(sandbox_id).await?;
        self.stage_all(&record).await?;
        let names = git(&record.worktree, &["diff", "--cached", "--name-only", "HEAD"]).await?;
        let patch = git(&record.worktree, &["diff", "--cached", "--binary", "HEAD"]).await?;
        Ok(SandboxDiff {
            files: names
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            patch,
        })
    }

    async fn apply(&self, sandbox_id: &str, paths: Option<&[String]>) -> Result<Vec<String>> {
        let record = self.require_record(sandbox_id).await?;
        let diff = self.get_diff(sandbox_id).await?;
        let selected: Vec<String> = match paths {
            None => diff.files.clone(),
            Some(paths) => {
                let available: BTreeSet<&str> = diff.files.iter().map(String::as_str).collect();
                if let Some(missing) = paths.iter().find(|p| !available.contains(p.as_str())) {
                    bail!("{} has no changes in sandbox {}", missing, sandbox_id);
                }
                paths.to_vec()
            }
        };
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let patch = if paths.is_none() {
            diff.patch
        } else {
            let mut args = vec!["diff", "--cached", "--binary", "HEAD", "--"];
            args.extend(selected.iter().map(String::as_str));
            git(&record.worktree, &args).await?
        };
        git_with_stdin(
            &record.project_root,
            &["apply", "--whitespace=nowarn", "-"],
            patch.as_bytes(),
        )
        .await
        .context("Failed to apply sandbox changes")?;

        tracing::info!(sandbox_id, files = selected.len(), "Sandbox changes applied");
        Ok(selected)
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        let Some(record) = self.load_record(sandbox_id).await? else {
            return Ok(());
        };
        if record.worktree.exists() {
            let worktree = record.worktree.to_string_lossy().to_string();
            git(&record.project_root, &["worktree", "remove", "--force", &worktree])
                .await
                .context("git worktree remove failed")?;
        } else if let Err(e) = git(&record.project_root, &["worktree", "prune"]).await {
            tracing::warn!(sandbox_id, error = %format!("{:#}", e), "Failed to prune worktrees");
        }
        if let Err(e) = git(&record.project_root, &["branch", "-D", &record.branch]).await {
            tracing::warn!(sandbox_id, error = %format!("{:#}", e), "Failed to delete sandbox branch");
        }
        match tokio::fs::remove_file(self.record_path(sandbox_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to remove sandbox record"),
        }
        tracing::info!(sandbox_id, "Sandbox destroyed");
        Ok(())
    }
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn git_with_stdin(dir: &Path, args: &[&str], input: &[u8]) -> Result<()> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await.context("Failed to write to git")?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "user.name", "Test"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    fn sandbox(root: &Path) -> WorktreeSandbox {
        WorktreeSandbox::new(WorktreeConfig {
            root: root.to_path_buf(),
            branch_prefix: "agent-manager/".into(),
        })
    }

    fn request(project: &Path, scope: &str) -> SandboxRequest {
        SandboxRequest {
            run_id: "run1".into(),
            project_root: project.to_path_buf(),
            scope_path: scope.into(),
        }
    }

    #[tokio::test]
    async fn test_create_diff_apply_destroy() -> Result<()> {
        let repo = setup_repo();
        let roots = tempfile::tempdir()?;
        let sb = sandbox(roots.path());

        let info = sb.create(&request(repo.path(), "src")).await?;
        assert!(info.work_dir.ends_with("src"));
        assert!(sb.get_diff(&info.id).await?.is_empty());

        fs::write(info.work_dir.join("lib.rs"), "pub fn a() {}\npub fn b() {}\n")?;
        fs::write(info.work_dir.join("new.rs"), "// new\n")?;
        let diff = sb.get_diff(&info.id).await?;
        assert_eq!(diff.files, vec!["src/lib.rs".to_string(), "src/new.rs".to_string()]);
        assert!(diff.patch.contains("pub fn b"));

        // Project is untouched until apply.
        assert!(!repo.path().join("src/new.rs").exists());
        let applied = sb.apply(&info.id, Some(&["src/new.rs".to_string()])).await?;
        assert_eq!(applied, vec!["src/new.rs".to_string()]);
        assert!(repo.path().join("src/new.rs").exists());
        assert!(!fs::read_to_string(repo.path().join("src/lib.rs"))?.contains("pub fn b"));

        sb.destroy(&info.id).await?;
        assert!(!roots.path().join(&info.id).exists());
        // Idempotent.
        sb.destroy(&info.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_apply_rejects_unknown_path() -> Result<()> {
        let repo = setup_repo();
        let roots = tempfile::tempdir()?;
        let sb = sandbox(roots.path());
        let info = sb.create(&request(repo.path(), "")).await?;
        fs::write(info.work_dir.join("README.md"), "changed\n")?;

        let err = sb
            .apply(&info.id, Some(&["src/other.rs".to_string()]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("src/other.rs"));

        let applied = sb.apply(&info.id, None).await?;
        assert_eq!(applied, vec!["README.md".to_string()]);
        assert_eq!(fs::read_to_string(repo.path().join("README.md"))?, "changed\n");
        sb.destroy(&info.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_create_is_reentrant_for_same_run() -> Result<()> {
        let repo = setup_repo();
        let roots = tempfile::tempdir()?;
        let sb = sandbox(roots.path());
        let first = sb.create(&request(repo.path(), "src")).await?;
        let second = sb.create(&request(repo.path(), "src")).await?;
        assert_eq!(first, second);
        sb.destroy(&first.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_sandbox_diff_fails() {
        let roots = tempfile::tempdir().unwrap();
        let sb = sandbox(roots.path());
        assert!(sb.get_diff("sbx-missing").await.is_err());
    }
}
