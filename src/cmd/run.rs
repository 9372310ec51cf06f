//! Run commands: `agent-manager run ...`.
//!
//! `run start` and `run resume` host the executor in this process and
//! wait for it, printing phase changes as they happen. Ctrl-C stops the
//! run.

use anyhow::{Context, Result, anyhow};
use std::time::Duration;

use agent_manager::domain::{EventPayload, Run, RunMode, RunStatus};
use agent_manager::orchestrator::{CreateRunRequest, Orchestrator};
use agent_manager::store::{EventQuery, RunFilter};
use agent_manager::util::preview;

use super::{AppContext, print_json};
use crate::{ModeArg, RunCommands};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_PREVIEW_CHARS: usize = 160;

pub async fn cmd_run(ctx: &AppContext, command: RunCommands) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    match command {
        RunCommands::Start {
            task,
            profile,
            prompt,
            mode,
            in_place,
            idempotency_key,
        } => {
            let mut request = CreateRunRequest::new(&task, &profile);
            request.prompt = prompt;
            request.mode = mode.map(|m| match m {
                ModeArg::Sandboxed => RunMode::Sandboxed,
                ModeArg::InPlace => RunMode::InPlace,
            });
            request.force_in_place = in_place;
            request.idempotency_key = idempotency_key;

            let run = orchestrator.create_run(request).await?;
            if !ctx.json {
                println!("Run {} created ({})", run.id, run.mode.as_str());
            }
            let finished = follow(ctx, &orchestrator, &run.id).await?;
            report(ctx, &finished)?;
        }
        RunCommands::Resume { id } => {
            let run = orchestrator.resume_run(&id).await?;
            if !ctx.json {
                println!("Resuming run {} from {}", run.id, run.phase);
            }
            let finished = follow(ctx, &orchestrator, &run.id).await?;
            report(ctx, &finished)?;
        }
        RunCommands::List {
            status,
            task,
            limit,
        } => {
            let statuses = status
                .iter()
                .map(|s| s.parse::<RunStatus>().map_err(|e| anyhow!(e)))
                .collect::<Result<Vec<_>>>()?;
            let runs = orchestrator
                .list_runs(RunFilter {
                    statuses,
                    task_id: task,
                    limit,
                })
                .await?;
            if ctx.json {
                return print_json(&runs);
            }
            if runs.is_empty() {
                println!("No runs.");
            }
            for run in runs {
                println!(
                    "{}  {:<9} {:<18} {:>3}%  {}",
                    run.id,
                    run.status,
                    run.phase,
                    run.progress_percent,
                    run.effective_tag()
                );
            }
        }
        RunCommands::Stop { id, terminate } => {
            let run = orchestrator.stop_run(&id).await?;
            if terminate {
                let outcome = ctx.terminator().terminate_run(&run).await;
                if !outcome.success {
                    tracing::warn!(run_id = %id, error = ?outcome.error, "Process termination failed");
                }
            }
            let run = orchestrator.get_run(&id).await?;
            report(ctx, &run)?;
        }
        RunCommands::Progress { id } => {
            let progress = orchestrator.get_run_progress(&id).await?;
            if ctx.json {
                return print_json(&progress);
            }
            println!("Run:      {}", progress.run_id);
            println!("Status:   {}", progress.status);
            println!(
                "Phase:    {} ({}%) - {}",
                progress.phase, progress.progress_percent, progress.phase_description
            );
            println!("Action:   {}", progress.current_action);
            if let Some(secs) = progress.elapsed_secs {
                println!("Elapsed:  {}s", secs);
            }
            println!("Updated:  {}", progress.last_update.to_rfc3339());
        }
        RunCommands::Events { id, after, limit } => {
            let query = EventQuery {
                after_sequence: after,
                limit,
                ..Default::default()
            };
            let events = orchestrator.get_run_events(&id, &query).await?;
            if ctx.json {
                return print_json(&events);
            }
            for event in events {
                println!("{:>5}  {}", event.sequence, describe(&event.payload));
            }
        }
        RunCommands::Approve { id, paths } => {
            let paths = (!paths.is_empty()).then_some(paths);
            let run = orchestrator.approve_run(&id, paths).await?;
            report(ctx, &run)?;
        }
        RunCommands::Reject { id, reason } => {
            let run = orchestrator.reject_run(&id, reason).await?;
            report(ctx, &run)?;
        }
        RunCommands::Diff { id } => {
            let diff = orchestrator.get_run_diff(&id).await?;
            if ctx.json {
                return print_json(&diff);
            }
            print!("{}", diff.patch);
        }
    }
    Ok(())
}

/// Wait for the run to settle, printing phase changes. Ctrl-C stops it.
async fn follow(ctx: &AppContext, orchestrator: &Orchestrator, run_id: &str) -> Result<Run> {
    let mut last_phase = None;
    let mut interrupted = false;
    loop {
        let run = orchestrator.get_run(run_id).await?;
        if !ctx.json && last_phase != Some(run.phase) {
            println!("  [{:>3}%] {}", run.progress_percent, run.phase.description());
            last_phase = Some(run.phase);
        }
        if run.status.is_terminal() && !orchestrator.has_live_executor(run_id) {
            orchestrator.shutdown().await;
            return Ok(run);
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                println!("Stopping run {}...", run_id);
                if let Err(e) = orchestrator.stop_run(run_id).await {
                    tracing::warn!(run_id, error = %e, "Stop request failed");
                }
            }
        }
    }
}

fn report(ctx: &AppContext, run: &Run) -> Result<()> {
    if ctx.json {
        return print_json(run);
    }
    println!("Run {}: {} ({})", run.id, run.status, run.phase);
    if let Some(error) = &run.error_message {
        println!("  error: {}", error);
    }
    if let Some(summary) = &run.summary
        && !summary.description.is_empty()
    {
        println!("  summary: {}", summary.description);
    }
    Ok(())
}

fn describe(payload: &EventPayload) -> String {
    match payload {
        EventPayload::Message { role, content } => {
            format!("{}: {}", role.as_str(), preview(content, EVENT_PREVIEW_CHARS))
        }
        EventPayload::ToolCall { name, .. } => format!("tool call {}", name),
        EventPayload::ToolResult { name, is_error, .. } => {
            if *is_error {
                format!("tool result {} (error)", name)
            } else {
                format!("tool result {}", name)
            }
        }
        EventPayload::Status { old, new } => format!("status {} -> {}", old, new),
        EventPayload::Error { code, message } => {
            format!("error [{}] {}", code, preview(message, EVENT_PREVIEW_CHARS))
        }
    }
}
