use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ProcessInfo, ProcessProbe, Signal, command_matches_tag, extract_tag};

#[derive(Debug, Clone)]
struct FakeProcess {
    command: String,
    started_at: DateTime<Utc>,
    pgid: i32,
    ignores_term: bool,
    ignores_kill: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    processes: BTreeMap<u32, FakeProcess>,
    signals: Vec<(i64, Signal)>,
    commands: Vec<String>,
    stop_command_works: bool,
}

/// In-memory process table for tests.
///
/// Processes die on the first signal they do not ignore; a group signal
/// always kills every member of the group.
#[derive(Debug, Default)]
pub struct FakeProcessProbe {
    state: Mutex<FakeState>,
}

impl FakeProcessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("fake probe poisoned"))?;
        Ok(f(&mut state))
    }

    /// Add a process; it leads its own process group.
    pub fn spawn(&self, pid: u32, command: &str, started_at: DateTime<Utc>) {
        let _ = self.with_state(|s| {
            s.processes.insert(
                pid,
                FakeProcess {
                    command: command.to_string(),
                    started_at,
                    pgid: pid as i32,
                    ignores_term: false,
                    ignores_kill: false,
                },
            );
        });
    }

    /// Add `claude --tag <tag>` started `age` ago.
    pub fn spawn_tagged(&self, pid: u32, tag: &str, age: chrono::Duration) {
        self.spawn(
            pid,
            &format!("claude --print --tag {}", tag),
            Utc::now() - age,
        );
    }

    pub fn ignore_term(&self, pid: u32) {
        let _ = self.with_state(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.ignores_term = true;
            }
        });
    }

    /// The process survives both SIGTERM and SIGKILL to its pid; only a
    /// group kill removes it.
    pub fn ignore_direct_signals(&self, pid: u32) {
        let _ = self.with_state(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.ignores_term = true;
                p.ignores_kill = true;
            }
        });
    }

    /// Make `resource-<kind> agents stop <tag>` kill matching processes.
    pub fn set_stop_command_works(&self, works: bool) {
        let _ = self.with_state(|s| s.stop_command_works = works);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.with_state(|s| s.processes.contains_key(&pid))
            .unwrap_or(false)
    }

    /// Signals delivered so far; group signals carry a negative target.
    pub fn signals(&self) -> Vec<(i64, Signal)> {
        self.with_state(|s| s.signals.clone()).unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.commands.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProcessProbe for FakeProcessProbe {
    async fn find_by_tag(&self, tag: &str) -> Result<Vec<u32>> {
        self.with_state(|s| {
            s.processes
                .iter()
                .filter(|(_, p)| command_matches_tag(&p.command, tag))
                .map(|(pid, _)| *pid)
                .collect()
        })
    }

    async fn list_agent_processes(&self, terms: &[String]) -> Result<Vec<ProcessInfo>> {
        self.with_state(|s| {
            s.processes
                .iter()
                .filter(|(_, p)| terms.iter().any(|t| p.command.contains(t.as_str())))
                .map(|(pid, p)| ProcessInfo {
                    pid: *pid,
                    command: p.command.clone(),
                    tag: extract_tag(&p.command),
                })
                .collect()
        })
    }

    async fn started_at(&self, pid: u32) -> Result<Option<DateTime<Utc>>> {
        self.with_state(|s| s.processes.get(&pid).map(|p| p.started_at))
    }

    async fn process_group(&self, pid: u32) -> Result<Option<i32>> {
        self.with_state(|s| s.processes.get(&pid).map(|p| p.pgid))
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<bool> {
        self.with_state(|s| {
            s.signals.push((pid as i64, signal));
            let Some(process) = s.processes.get(&pid) else {
                return false;
            };
            let survives = match signal {
                Signal::Term => process.ignores_term,
                Signal::Kill => process.ignores_kill,
            };
            if !survives {
                s.processes.remove(&pid);
            }
            true
        })
    }

    async fn signal_group(&self, pgid: i32, signal: Signal) -> Result<bool> {
        self.with_state(|s| {
            s.signals.push((-(pgid as i64), signal));
            let before = s.processes.len();
            s.processes.retain(|_, p| p.pgid != pgid);
            s.processes.len() < before
        })
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool> {
        self.with_state(|s| {
            s.commands.push(format!("{} {}", program, args.join(" ")));
            if !s.stop_command_works {
                return false;
            }
            if let Some(tag) = args.last() {
                s.processes
                    .retain(|_, p| !command_matches_tag(&p.command, tag));
            }
            true
        })
    }
}
