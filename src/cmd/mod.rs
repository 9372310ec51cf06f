//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `serve`    | `Serve`                                   |
//! | `catalog`  | `Profile`, `Task`                         |
//! | `run`      | `Run`                                     |
//! | `ops`      | `Stale`, `Reconcile`, `Terminate`         |
//! | `config`   | `Config`                                  |
//!
//! `context` wires the store, adapters and services from settings.

pub mod catalog;
pub mod config;
pub mod context;
pub mod ops;
pub mod run;
pub mod serve;

pub use catalog::{cmd_profile, cmd_task};
pub use config::cmd_config;
pub use context::AppContext;
pub use ops::{cmd_reconcile, cmd_stale, cmd_terminate};
pub use run::cmd_run;
pub use serve::cmd_serve;

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
