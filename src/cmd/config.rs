//! Configuration view and validation commands: `agent-manager config`.

use anyhow::{Context, Result, bail};
use std::path::Path;

use agent_manager::config::{AppConfig, CONFIG_FILE, STATE_DIR, Settings};

use crate::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    config_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let default_path = project_dir.join(STATE_DIR).join(CONFIG_FILE);
    let path = config_path.unwrap_or(&default_path);

    match command {
        None | Some(ConfigCommands::Show) => {
            let settings = Settings::load(project_dir, config_path)?;
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No config file at {} (defaults)", path.display());
            }
            println!("# Database: {}", settings.db_path().display());
            println!();
            let rendered =
                toml::to_string_pretty(&settings.file).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }
            let config = AppConfig::load(path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            AppConfig::default().save(path)?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
