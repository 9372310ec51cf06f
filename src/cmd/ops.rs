//! Supervision commands: `agent-manager stale|reconcile|terminate`.

use anyhow::{Result, anyhow};
use std::time::Duration;

use agent_manager::domain::RunnerKind;

use super::{AppContext, print_json};

pub async fn cmd_stale(ctx: &AppContext, threshold_secs: Option<u64>) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let runs = orchestrator
        .list_stale_runs(threshold_secs.map(Duration::from_secs))
        .await?;
    if ctx.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No stale runs.");
        return Ok(());
    }
    for run in runs {
        let heartbeat = run
            .last_heartbeat
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<18} last heartbeat {}  tag {}",
            run.id,
            run.phase,
            heartbeat,
            run.effective_tag()
        );
    }
    Ok(())
}

pub async fn cmd_reconcile(ctx: &AppContext) -> Result<()> {
    let stats = ctx.reconciler().run_once().await;
    if ctx.json {
        return print_json(&stats);
    }
    println!("Checked:   {}", stats.checked);
    println!("Stale:     {}", stats.stale);
    println!("Failed:    {}", stats.failed);
    println!("Recovered: {}", stats.recovered);
    println!("Orphans:   {}", stats.orphans);
    println!("Killed:    {}", stats.killed);
    if stats.errors > 0 {
        println!("Errors:    {}", stats.errors);
    }
    Ok(())
}

pub async fn cmd_terminate(ctx: &AppContext, tag: &str, kind: Option<&str>) -> Result<()> {
    let kind = kind
        .map(|k| k.parse::<RunnerKind>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let outcome = ctx.terminator().terminate_tag(tag, kind).await;
    if ctx.json {
        print_json(&outcome)?;
    } else if outcome.success {
        let method = outcome.final_method.map(|m| m.as_str()).unwrap_or("unknown");
        println!("Terminated {} ({}, {} attempt(s))", tag, method, outcome.attempts);
    } else {
        println!(
            "Failed to terminate {}: {}",
            tag,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    if outcome.success {
        Ok(())
    } else {
        Err(anyhow!("termination of {} failed", tag))
    }
}
