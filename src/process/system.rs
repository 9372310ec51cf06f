use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::process::Command;

use super::{ProcessInfo, ProcessProbe, Signal, command_matches_tag, extract_tag};

/// Probe over the live OS: `pgrep`, `/proc` and `kill(2)`.
#[derive(Debug, Default, Clone)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }

    async fn pgrep(&self, pattern: &str) -> Result<Vec<(u32, String)>> {
        let output = Command::new("pgrep")
            .args(["-af", pattern])
            .output()
            .await
            .context("Failed to run pgrep")?;
        // Exit status 1 means no match.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let own_pid = std::process::id();
        Ok(parse_pgrep(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|(pid, _)| *pid != own_pid)
            .collect())
    }
}

/// Parse `pgrep -af` output: `<pid> <command line>` per line.
pub(crate) fn parse_pgrep(output: &str) -> Vec<(u32, String)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some((pid.parse().ok()?, command.trim().to_string()))
        })
        .collect()
}

/// Fields of `/proc/<pid>/stat` after the parenthesised command name,
/// which may itself contain spaces. Index 0 is field 3 (state).
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let close = stat.rfind(')')?;
    Some(stat[close + 1..].split_whitespace().collect())
}

/// Field 22: start time in clock ticks since boot.
pub(crate) fn parse_start_ticks(stat: &str) -> Option<u64> {
    stat_fields(stat)?.get(19)?.parse().ok()
}

/// Field 5: process group id.
pub(crate) fn parse_pgid(stat: &str) -> Option<i32> {
    stat_fields(stat)?.get(2)?.parse().ok()
}

fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

fn deliver(target: libc::pid_t, signal: Signal) -> Result<bool> {
    // SAFETY: kill(2) only reads its arguments.
    if unsafe { libc::kill(target, signal.as_raw()) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err).with_context(|| format!("Failed to send {:?} to {}", signal, target))
}

#[async_trait]
impl ProcessProbe for SystemProbe {
    async fn find_by_tag(&self, tag: &str) -> Result<Vec<u32>> {
        Ok(self
            .pgrep(tag)
            .await?
            .into_iter()
            .filter(|(_, command)| command_matches_tag(command, tag))
            .map(|(pid, _)| pid)
            .collect())
    }

    async fn list_agent_processes(&self, terms: &[String]) -> Result<Vec<ProcessInfo>> {
        let mut seen = std::collections::BTreeMap::new();
        for term in terms {
            for (pid, command) in self.pgrep(term).await? {
                seen.entry(pid).or_insert_with(|| ProcessInfo {
                    pid,
                    tag: extract_tag(&command),
                    command,
                });
            }
        }
        Ok(seen.into_values().collect())
    }

    async fn started_at(&self, pid: u32) -> Result<Option<DateTime<Utc>>> {
        let stat = match tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read process stat"),
        };
        let uptime = tokio::fs::read_to_string("/proc/uptime")
            .await
            .context("Failed to read /proc/uptime")?;
        let Some(uptime_secs) = uptime
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
        else {
            return Ok(None);
        };
        let Some(ticks) = parse_start_ticks(&stat) else {
            return Ok(None);
        };
        let now = Utc::now();
        let boot = now - Duration::milliseconds((uptime_secs * 1000.0) as i64);
        let since_boot_ms = ticks.saturating_mul(1000) / clock_ticks_per_second();
        Ok(Some(boot + Duration::milliseconds(since_boot_ms as i64)))
    }

    async fn process_group(&self, pid: u32) -> Result<Option<i32>> {
        match tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await {
            Ok(stat) => Ok(parse_pgid(&stat)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read process stat"),
        }
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<bool> {
        deliver(pid as libc::pid_t, signal)
    }

    async fn signal_group(&self, pgid: i32, signal: Signal) -> Result<bool> {
        // SAFETY: getpgrp has no preconditions.
        let own_group = unsafe { libc::getpgrp() };
        if pgid <= 1 || pgid == own_group {
            anyhow::bail!("refusing to signal process group {}", pgid);
        }
        deliver(-pgid, signal)
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool> {
        match Command::new(program).args(args).output().await {
            Ok(output) => Ok(output.status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to run {}", program)),
        }
    }
}
