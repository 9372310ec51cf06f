//! Long-running service: `agent-manager serve`.

use anyhow::{Context, Result};

use super::AppContext;

pub async fn cmd_serve(ctx: AppContext, reconcile: bool, extract: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let health = orchestrator.health().await;
    for runner in &health.runners {
        if !runner.available {
            tracing::warn!(kind = %runner.kind, message = %runner.message, "Runner unavailable");
        }
    }

    let reconciler = ctx.reconciler();
    if reconcile {
        reconciler.start()?;
    }
    let worker = ctx.worker()?;
    if extract {
        worker.start()?;
    }

    tracing::info!(
        project = %ctx.settings.project_dir.display(),
        db = %ctx.settings.db_path().display(),
        reconciler = reconcile,
        worker = extract,
        "agent-manager serving"
    );
    println!("agent-manager running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    worker.stop().await;
    reconciler.stop().await;
    orchestrator.shutdown().await;
    Ok(())
}
