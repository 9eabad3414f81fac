//! Cinder Protocol
//!
//! Shared types for the hot-reload delta pipeline: module update batches
//! produced by the compilation orchestrator, the wire payloads exchanged with
//! the in-process agent, and the one-byte apply acknowledgement.
//! Payloads are serialized as JSON documents, one per line, over the local
//! update channel.

use uuid::Uuid;

pub mod types;
pub mod wire;

pub use types::*;
pub use wire::*;

/// Well-known name of the local update channel. The server realizes it as a
/// Unix domain socket with this file name inside a per-user runtime directory.
pub const PIPE_NAME: &str = "netcore-hot-reload";

/// Environment entry carrying the channel path, set by the tool on the
/// child's launch spec and read by the agent at startup.
pub const PIPE_ENV_VAR: &str = "DOTNET_HOTRELOAD_NAMEDPIPE_NAME";

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
