//! Per-iteration watch state
//!
//! One `WatchContext` lives for the whole watch loop; its iteration index
//! advances on every restart of the target process. The process spec's
//! environment map is seeded during iteration-0 initialization and must not
//! change while the target is launching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::refresh::RefreshServer;

/// Forces the runtime into edit-continuation-compatible code generation.
pub const ENV_FORCE_ENC: &str = "COMPLUS_ForceEnc";

/// Startup-hook entry naming the agent module loaded into the child.
pub const ENV_STARTUP_HOOKS: &str = "DOTNET_STARTUP_HOOKS";

/// Socket path the agent connects back on.
pub const ENV_PIPE_PATH: &str = cinder_protocol::PIPE_ENV_VAR;

/// How the next target process will be launched: program, arguments, and the
/// environment entries layered on top of the inherited environment.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
        }
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Seed the launch environment so the agent is loaded into the child and
    /// the runtime emits patchable code. Idempotent; called once during
    /// iteration-0 initialization.
    pub fn seed_hot_reload_env(&mut self, base_dir: &Path, pipe_path: &Path) {
        self.set_env(ENV_FORCE_ENC, "1");
        self.set_env(
            ENV_STARTUP_HOOKS,
            base_dir.join("hotreload").join("libcinder_agent.so").display().to_string(),
        );
        self.set_env(ENV_PIPE_PATH, pipe_path.display().to_string());
    }
}

/// Which runtime flavor the target project runs on; selects the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRuntime {
    /// A local process hosting the agent; deltas travel the pipe.
    Process,
    /// A browser-hosted runtime; deltas travel the refresh channel.
    Browser,
}

/// Per-iteration state shared between the driver, appliers, and launcher.
pub struct WatchContext {
    /// 0 on first launch; > 0 after a restart caused by a rude edit or a
    /// build failure.
    pub iteration: u32,
    pub project_path: PathBuf,
    pub process_spec: ProcessSpec,
    pub browser_refresh: Option<RefreshServer>,
}

impl WatchContext {
    pub fn new(project_path: impl Into<PathBuf>, process_spec: ProcessSpec) -> Self {
        Self {
            iteration: 0,
            project_path: project_path.into(),
            process_spec,
            browser_refresh: None,
        }
    }

    pub fn with_browser_refresh(mut self, server: RefreshServer) -> Self {
        self.browser_refresh = Some(server);
        self
    }

    /// Advance to the next iteration after a restart.
    pub fn next_iteration(&mut self) {
        self.iteration += 1;
    }
}
