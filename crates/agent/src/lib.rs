//! Cinder Agent
//!
//! The startup-loaded half of the hot-reload pipeline. The host's
//! startup-hook facility calls [`initialize`] once at process load; the agent
//! then connects back to the watch tool over the local update channel on a
//! background task, applies each module delta through the runtime's update
//! facility, and answers every payload with a one-byte ack. The host's main
//! thread is never blocked, and apply failures are caught, logged, and acked
//! — the agent never tears down the host process.

use std::sync::Arc;

pub mod client;
pub mod registry;

pub use client::{AgentConfig, AgentHandle, AgentState};
pub use registry::{LoadedModule, ModuleRegistry, RuntimeUpdater, UpdateError};

/// Startup-hook entry point. Spawns the agent's background task and returns
/// a handle the host may use to observe the agent's lifecycle.
pub fn initialize(
    config: AgentConfig,
    registry: Arc<ModuleRegistry>,
    updater: Arc<dyn RuntimeUpdater>,
) -> AgentHandle {
    client::spawn(config, registry, updater)
}
