//! Tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays
//! parseable. When file logging is enabled, records are also written as
//! daily-rotated JSONL under the log directory.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "agent-manager";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit console records as JSON instead of compact text.
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: bool,
    /// Defaults to `.agent-manager/logs`.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> u64 {
    7
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: false,
            dir: None,
            retention_days: default_retention_days(),
        }
    }
}

/// Install the global subscriber. Returns the file writer guard, which
/// must be held for the life of the process when file logging is on.
///
/// Calling this twice is harmless: the second install is ignored.
pub fn init_logging(config: &LoggingConfig, log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let compact_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });

    let (file_layer, guard) = if config.file {
        fs::create_dir_all(log_dir)?;
        cleanup_old_logs(log_dir, config.retention_days)?;

        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("jsonl")
            .build(log_dir)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_current_span(false)
            .with_span_list(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(compact_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

/// Remove `agent-manager.YYYY-MM-DD.jsonl` files older than the retention window.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", LOG_FILE_PREFIX);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_removes_only_expired_log_files() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("agent-manager.2001-01-01.jsonl");
        let today = dir
            .path()
            .join(format!("agent-manager.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("other.2001-01-01.jsonl");
        for path in [&old, &today, &unrelated] {
            fs::write(path, "{}\n").unwrap();
        }

        let removed = cleanup_old_logs(dir.path(), 7).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(today.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.file);
        assert_eq!(config.retention_days, 7);
    }
}
