//! Narrow view of OS process state used by the reconciler and terminator.
//!
//! Everything platform specific (pgrep output, `/proc` stat fields, signal
//! delivery) stays behind [`ProcessProbe`]. [`FakeProcessProbe`] stands in
//! for the OS in tests.

mod fake;
mod system;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use fake::FakeProcessProbe;
pub use system::SystemProbe;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    /// Run tag parsed from the command line, if any.
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Pids whose command line carries `tag`.
    async fn find_by_tag(&self, tag: &str) -> Result<Vec<u32>>;

    /// Processes whose command line matches any of `terms`.
    async fn list_agent_processes(&self, terms: &[String]) -> Result<Vec<ProcessInfo>>;

    async fn started_at(&self, pid: u32) -> Result<Option<DateTime<Utc>>>;

    async fn process_group(&self, pid: u32) -> Result<Option<i32>>;

    /// Deliver `signal`. `Ok(false)` means the process was already gone.
    async fn signal(&self, pid: u32, signal: Signal) -> Result<bool>;

    async fn signal_group(&self, pgid: i32, signal: Signal) -> Result<bool>;

    /// Run an external stop command; `Ok(true)` when it exited zero.
    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool>;
}

/// Pull the run tag out of a command line.
///
/// Recognizes `--tag <value>` and `--tag=<value>`.
pub fn extract_tag(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "--tag" {
            return tokens.next().map(str::to_string);
        }
        if let Some(value) = token.strip_prefix("--tag=")
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Whether a command line belongs to `tag`: exact match on the tag
/// argument when there is one, substring match otherwise.
pub fn command_matches_tag(command: &str, tag: &str) -> bool {
    match extract_tag(command) {
        Some(found) => found == tag,
        None => command.contains(tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tag_forms() {
        assert_eq!(
            extract_tag("claude --print --tag run-123 --model x").as_deref(),
            Some("run-123")
        );
        assert_eq!(extract_tag("codex --tag=abc exec").as_deref(), Some("abc"));
        assert_eq!(extract_tag("claude --print"), None);
        assert_eq!(extract_tag("claude --tag"), None);
        assert_eq!(extract_tag("claude --tag="), None);
    }

    #[test]
    fn test_tag_match_is_exact_when_argument_present() {
        assert!(command_matches_tag("claude --tag run-1", "run-1"));
        assert!(!command_matches_tag("claude --tag run-10", "run-1"));
        // No tag argument: fall back to substring.
        assert!(command_matches_tag("claude run-1 work", "run-1"));
    }
}
