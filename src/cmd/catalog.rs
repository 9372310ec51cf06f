//! Profile and task commands: `agent-manager profile|task`.

use anyhow::{Result, anyhow};

use agent_manager::domain::{ProfileInput, RunnerKind, TaskInput};

use super::{AppContext, print_json};
use crate::{ProfileCommands, TaskCommands};

pub async fn cmd_profile(ctx: &AppContext, command: ProfileCommands) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    match command {
        ProfileCommands::Add {
            name,
            runner,
            model,
            max_turns,
            sandbox,
        } => {
            let runner_kind: RunnerKind = runner.parse().map_err(|e: String| anyhow!(e))?;
            let profile = orchestrator
                .create_profile(ProfileInput {
                    name,
                    runner_kind,
                    model,
                    max_turns,
                    requires_sandbox: sandbox,
                })
                .await?;
            if ctx.json {
                print_json(&profile)?;
            } else {
                println!("Created profile {} ({})", profile.id, profile.name);
            }
        }
        ProfileCommands::List => {
            let profiles = orchestrator.list_profiles().await?;
            if ctx.json {
                return print_json(&profiles);
            }
            if profiles.is_empty() {
                println!("No profiles.");
            }
            for p in profiles {
                println!(
                    "{}  {:<20} {:<9} {:<16} turns={} sandbox={}",
                    p.id, p.name, p.runner_kind, p.model, p.max_turns, p.requires_sandbox
                );
            }
        }
    }
    Ok(())
}

pub async fn cmd_task(ctx: &AppContext, command: TaskCommands) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    match command {
        TaskCommands::Add {
            title,
            description,
            scope,
            root,
        } => {
            let task = orchestrator
                .create_task(TaskInput {
                    title,
                    description,
                    scope_path: scope,
                    project_root: root
                        .map(|r| r.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                })
                .await?;
            if ctx.json {
                print_json(&task)?;
            } else {
                println!("Created task {} ({})", task.id, task.title);
            }
        }
        TaskCommands::List => {
            let tasks = orchestrator.list_tasks().await?;
            if ctx.json {
                return print_json(&tasks);
            }
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for t in tasks {
                println!(
                    "{}  {:<10} {:<30} {}",
                    t.id,
                    t.status.as_str(),
                    t.title,
                    t.scope_path
                );
            }
        }
    }
    Ok(())
}
