//! Scope locks that keep two runs from writing the same part of a project.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Lock `scope` for `owner`. Re-acquiring by the same owner returns the
    /// existing lock id; overlapping scopes held by others are refused.
    async fn acquire(&self, scope: &Path, owner: &str) -> Result<String>;

    /// Release a lock by id. Unknown ids are ignored.
    async fn release(&self, lock_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Held {
    lock_id: String,
    owner: String,
}

/// In-process lock table.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    held: Mutex<HashMap<PathBuf, Held>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Whether any run currently holds a lock on exactly `scope`.
    pub fn is_held(&self, scope: &Path) -> bool {
        let scope = normalize(scope);
        self.held
            .lock()
            .map(|h| h.contains_key(&scope))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, scope: &Path, owner: &str) -> Result<String> {
        let scope = normalize(scope);
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("lock table poisoned"))?;
        if let Some(existing) = held.get(&scope)
            && existing.owner == owner
        {
            return Ok(existing.lock_id.clone());
        }
        if let Some((path, other)) = held
            .iter()
            .find(|(path, h)| h.owner != owner && overlaps(path, &scope))
        {
            bail!("{} is locked by run {}", path.display(), other.owner);
        }
        let lock_id = format!("lock-{}", uuid::Uuid::new_v4());
        held.insert(
            scope,
            Held {
                lock_id: lock_id.clone(),
                owner: owner.to_string(),
            },
        );
        Ok(lock_id)
    }

    async fn release(&self, lock_id: &str) -> Result<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("lock table poisoned"))?;
        let before = held.len();
        held.retain(|_, h| h.lock_id != lock_id);
        Ok(held.len() < before)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_reentrant_for_owner() -> Result<()> {
        let locks = MemoryLockManager::new();
        let first = locks.acquire(Path::new("/p/src"), "run-a").await?;
        let again = locks.acquire(Path::new("/p/./src"), "run-a").await?;
        assert_eq!(first, again);
        assert_eq!(locks.held_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_overlapping_scopes_conflict() -> Result<()> {
        let locks = MemoryLockManager::new();
        locks.acquire(Path::new("/p/src"), "run-a").await?;
        assert!(locks.acquire(Path::new("/p/src/api"), "run-b").await.is_err());
        assert!(locks.acquire(Path::new("/p"), "run-b").await.is_err());
        // Sibling scopes are independent.
        locks.acquire(Path::new("/p/docs"), "run-b").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_release_frees_scope() -> Result<()> {
        let locks = MemoryLockManager::new();
        let id = locks.acquire(Path::new("/p/src"), "run-a").await?;
        assert!(locks.is_held(Path::new("/p/src")));
        assert!(locks.release(&id).await?);
        assert!(!locks.is_held(Path::new("/p/src")));
        assert!(!locks.release(&id).await?);
        locks.acquire(Path::new("/p/src"), "run-b").await?;
        Ok(())
    }
}
