//! Seams onto the build system and the edit-continuation compiler
//!
//! The tool depends on the compiler's contract, not its implementation: a
//! loader opens the project into a warm `Solution`, and an edit-continuation
//! service turns a changed solution into an `UpdateBatch`. Both are traits so
//! the orchestration is testable with in-memory fakes and deployable against
//! an out-of-process compiler host.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cinder_protocol::{Diagnostic, UpdateBatch};
use tokio_util::sync::CancellationToken;

use crate::solution::Solution;

/// Opens the target project into a solution with every document text loaded,
/// and hands back the edit-continuation service attached to it.
#[async_trait]
pub trait ProjectLoader: Send + Sync {
    async fn load(
        &self,
        project_path: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<LoadedWorkspace>;
}

/// Result of a project load: the initial solution plus the service that
/// produces deltas for it.
pub struct LoadedWorkspace {
    pub solution: Solution,
    pub service: Arc<dyn EditContinuationService>,
}

/// The edit-continuation compiler's contract.
///
/// `emit_update` is the only long operation; session bookkeeping is
/// synchronous so the `EditSession` guard can close on every path, including
/// drops during unwinding.
#[async_trait]
pub trait EditContinuationService: Send + Sync {
    /// Derive the module deltas that take the running process from the
    /// last-committed solution to `solution`.
    async fn emit_update(
        &self,
        solution: &Solution,
        cancel: &CancellationToken,
    ) -> anyhow::Result<UpdateBatch>;

    /// Standalone compiler diagnostics for one project of `solution`.
    async fn compilation_diagnostics(
        &self,
        solution: &Solution,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Diagnostic>>;

    fn begin_session(&self);
    fn commit_session(&self);
    fn discard_session(&self);

    /// Release compiler resources when the workspace is torn down.
    fn dispose(&self) {}
}

/// Scoped region around one emit/commit-or-discard cycle.
///
/// Exactly one session may be open per orchestrator; the driver serializes
/// change handling under the solution lock. Dropping an undecided session
/// discards it, so the session ends on every path.
pub struct EditSession {
    service: Arc<dyn EditContinuationService>,
    decided: bool,
}

impl EditSession {
    pub fn begin(service: Arc<dyn EditContinuationService>) -> Self {
        service.begin_session();
        Self {
            service,
            decided: false,
        }
    }

    /// Commit the emitted batch. Legal only after an emit returned `Ready`.
    pub fn commit(mut self) {
        self.decided = true;
        self.service.commit_session();
    }

    pub fn discard(mut self) {
        self.decided = true;
        self.service.discard_session();
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if !self.decided {
            self.service.discard_session();
        }
    }
}
