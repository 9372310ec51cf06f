//! Core records shared by every subsystem.

pub mod models;
pub mod tags;

pub use models::*;
pub use tags::{Allowlist, AllowlistRule, INVESTIGATION_TAG_PREFIX, is_agent_manager_tag};
