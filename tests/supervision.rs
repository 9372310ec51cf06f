//! Reconciler and terminator over a fake process table: stale runs,
//! orphaned agents and signal escalation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use agent_manager::adapters::RunnerRegistry;
use agent_manager::domain::{ResolvedConfig, Run, RunStatus, RunnerKind};
use agent_manager::process::{FakeProcessProbe, Signal};
use agent_manager::reconciler::{Reconciler, ReconcilerConfig};
use agent_manager::store::Repositories;
use agent_manager::terminator::{TerminationMethod, Terminator, TerminatorConfig};

use common::RecordingBroadcaster;

fn quick_terminator() -> TerminatorConfig {
    TerminatorConfig::default()
        .with_grace_period(Duration::from_millis(10))
        .with_base_backoff(Duration::from_millis(5))
        .with_max_backoff(Duration::from_millis(20))
        .with_verify_timeout(Duration::from_millis(50))
}

fn running_since(run: &mut Run, minutes: i64) {
    let then = Utc::now() - chrono::Duration::minutes(minutes);
    run.status = RunStatus::Running;
    run.started_at = Some(then);
    run.last_heartbeat = Some(then);
}

#[tokio::test]
async fn test_stale_run_without_process_is_failed() {
    let dir = TempDir::new().unwrap();
    let repos = Repositories::in_memory().unwrap();
    let stale = common::seed_run(&repos, &dir, |run| running_since(run, 10))
        .await
        .unwrap();
    let fresh = common::seed_run(&repos, &dir, |run| running_since(run, 0))
        .await
        .unwrap();

    let broadcaster = RecordingBroadcaster::new();
    let reconciler = Reconciler::new(
        ReconcilerConfig::default(),
        repos.runs.clone(),
        Arc::new(FakeProcessProbe::new()),
    )
    .with_broadcaster(broadcaster.clone());

    let stats = reconciler.run_once().await;
    assert_eq!(stats.checked, 2);
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.failed, 1);

    let stale = repos.runs.get_run(&stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, RunStatus::Failed);
    assert!(stale.error_message.is_some());
    assert!(stale.ended_at.is_some());
    assert_eq!(broadcaster.statuses_for(&stale.id).len(), 1);

    let fresh = repos.runs.get_run(&fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, RunStatus::Running);
}

#[tokio::test]
async fn test_stale_run_with_live_process_is_refreshed() {
    let dir = TempDir::new().unwrap();
    let repos = Repositories::in_memory().unwrap();
    let run = common::seed_run(&repos, &dir, |run| running_since(run, 10))
        .await
        .unwrap();

    let probe = Arc::new(FakeProcessProbe::new());
    probe.spawn_tagged(4242, run.effective_tag(), chrono::Duration::minutes(10));
    let reconciler = Reconciler::new(
        ReconcilerConfig::default().with_auto_recover(true),
        repos.runs.clone(),
        probe.clone(),
    );

    let stats = reconciler.run_once().await;
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.failed, 0);

    let stored = repos.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert!(stored.last_heartbeat.unwrap() > run.last_heartbeat.unwrap());
    // The tagged process belongs to a known run, so it is never an orphan.
    assert_eq!(stats.orphans, 0);
    assert!(probe.is_alive(4242));
}

#[tokio::test]
async fn test_orphaned_agent_is_terminated() {
    let repos = Repositories::in_memory().unwrap();
    let probe = Arc::new(FakeProcessProbe::new());
    probe.spawn_tagged(100, "agent-manager-investigation-gone", chrono::Duration::minutes(30));
    // Too young to be judged.
    probe.spawn_tagged(101, "agent-manager-young", chrono::Duration::seconds(5));
    // Not ours.
    probe.spawn_tagged(102, "someone-elses-session", chrono::Duration::minutes(30));

    let terminator = Arc::new(Terminator::new(
        quick_terminator(),
        probe.clone(),
        RunnerRegistry::new(),
    ));
    let reconciler = Reconciler::new(
        ReconcilerConfig::default()
            .with_kill_orphans(true)
            .with_orphan_grace_period(Duration::from_secs(60)),
        repos.runs.clone(),
        probe.clone(),
    )
    .with_terminator(terminator);

    let stats = reconciler.run_once().await;
    assert_eq!(stats.orphans, 1);
    assert_eq!(stats.killed, 1);
    assert!(!probe.is_alive(100));
    assert!(probe.is_alive(101));
    assert!(probe.is_alive(102));
}

#[tokio::test]
async fn test_terminate_run_escalates_and_marks_cancelled() {
    let dir = TempDir::new().unwrap();
    let repos = Repositories::in_memory().unwrap();
    let run = common::seed_run(&repos, &dir, |run| {
        running_since(run, 1);
        run.tag = Some("run-escalate-1".to_string());
    })
    .await
    .unwrap();

    let probe = Arc::new(FakeProcessProbe::new());
    probe.spawn_tagged(300, "run-escalate-1", chrono::Duration::minutes(1));
    probe.ignore_term(300);

    let broadcaster = RecordingBroadcaster::new();
    let terminator = Terminator::new(quick_terminator(), probe.clone(), RunnerRegistry::new())
        .with_runs(repos.runs.clone())
        .with_broadcaster(broadcaster.clone());

    let outcome = terminator.terminate_run(&run).await;
    assert!(outcome.success);
    assert_eq!(outcome.final_method, Some(TerminationMethod::Sigkill));
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.process_was_gone);
    assert_eq!(
        probe.signals(),
        vec![(300, Signal::Term), (300, Signal::Kill)]
    );

    let stored = repos.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(broadcaster.statuses_for(&run.id).len(), 1);
}

#[tokio::test]
async fn test_resource_cli_is_used_when_kind_is_known() {
    let dir = TempDir::new().unwrap();
    let repos = Repositories::in_memory().unwrap();
    let run = common::seed_run(&repos, &dir, |run| {
        running_since(run, 1);
        run.tag = Some("run-cli-1".to_string());
        run.resolved_config = Some(ResolvedConfig {
            runner_kind: RunnerKind::Codex,
            model: "o4".to_string(),
            max_turns: 10,
            requires_review: false,
        });
    })
    .await
    .unwrap();

    let probe = Arc::new(FakeProcessProbe::new());
    probe.spawn(301, "codex exec --tag run-cli-1", Utc::now());
    probe.set_stop_command_works(true);

    let terminator = Terminator::new(quick_terminator(), probe.clone(), RunnerRegistry::new())
        .with_runs(repos.runs.clone());
    let outcome = terminator.terminate_run(&run).await;

    assert!(outcome.success);
    assert_eq!(outcome.final_method, Some(TerminationMethod::CliStop));
    assert_eq!(probe.commands(), vec!["resource-codex agents stop run-cli-1"]);
    assert!(probe.signals().is_empty());
}

#[tokio::test]
async fn test_terminate_missing_tag_is_already_gone() {
    let probe = Arc::new(FakeProcessProbe::new());
    let terminator = Terminator::new(quick_terminator(), probe.clone(), RunnerRegistry::new());

    let outcome = terminator.terminate_tag("run-nothing-here", None).await;
    assert!(outcome.success);
    assert!(outcome.process_was_gone);
    assert_eq!(outcome.final_method, Some(TerminationMethod::AlreadyGone));
    assert!(probe.signals().is_empty());
}
