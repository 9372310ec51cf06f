pub mod adapters;
pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod reconciler;
pub mod recommendations;
pub mod store;
pub mod terminator;
pub mod util;

pub use errors::{ErrorKind, OrchestratorError};
pub use orchestrator::{CreateRunRequest, Orchestrator, OrchestratorConfig};
