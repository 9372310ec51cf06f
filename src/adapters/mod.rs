//! Capability interfaces over the systems a run touches, plus the concrete
//! implementations the server wires by default.

pub mod broadcast;
pub mod cli_runner;
pub mod events;
pub mod extractor;
pub mod locks;
pub mod policy;
pub mod runner;
pub mod sandbox;
pub mod stream;

pub use broadcast::{BroadcastMessage, Broadcaster, ChannelBroadcaster, NullBroadcaster};
pub use cli_runner::{CliRunner, CliRunnerConfig};
pub use events::{EventSink, NoopEventSink, StoreEventSink};
pub use extractor::{ExtractionRequest, OllamaConfig, OllamaExtractor, RecommendationExtractor};
pub use locks::{LockManager, MemoryLockManager};
pub use policy::{PolicyDecision, PolicyEvaluator, PolicyRequest, ScopePolicy};
pub use runner::{ExecuteRequest, ExecuteResult, Runner, RunnerCapabilities, RunnerRegistry};
pub use sandbox::{SandboxDiff, SandboxInfo, SandboxProvider, SandboxRequest, WorktreeConfig, WorktreeSandbox};
