//! Loaded-module registry and the runtime update seam
//!
//! The agent finds the module to patch by its 128-bit version ID — the sole
//! key shared with the compiler. The runtime's update facility is a trait so
//! the agent depends on its contract, not its implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use uuid::Uuid;

/// A module loaded in the host process, keyed by its version ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub id: Uuid,
    pub name: String,
}

impl LoadedModule {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Modules the host registered at load time.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<Uuid, LoadedModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: LoadedModule) {
        self.modules.write().unwrap().insert(module.id, module);
    }

    pub fn resolve(&self, id: Uuid) -> Option<LoadedModule> {
        self.modules.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().unwrap().is_empty()
    }
}

/// Errors the runtime's update facility may surface.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("runtime rejected the delta: {0}")]
    Rejected(String),

    #[error("module {0} cannot be patched")]
    NotPatchable(Uuid),
}

/// The managed runtime's update primitive. Delta bytes are borrowed views
/// into the deserialized payload; implementations must not retain them.
pub trait RuntimeUpdater: Send + Sync {
    fn apply_update(
        &self,
        module: &LoadedModule,
        metadata_delta: &[u8],
        il_delta: &[u8],
        pdb_delta: &[u8],
    ) -> Result<(), UpdateError>;
}
