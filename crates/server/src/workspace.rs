//! Workspace holder
//!
//! Owns the hot compilation state for one iteration: the current solution and
//! the edit-continuation service attached to it. Initialization is lazy and
//! one-shot; a failed load leaves the holder degraded for the rest of the
//! iteration, and the outer loop recreates the holder (disposing the prior
//! workspace) on every restart.

use std::path::PathBuf;
use std::sync::{Arc, Once};

use anyhow::bail;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compile::{EditContinuationService, ProjectLoader};
use crate::solution::Solution;

static BUILD_LOCATOR: Once = Once::new();

/// Register the host build-system locator. Process-wide and idempotent; runs
/// before the first project load.
pub fn register_build_locator() {
    BUILD_LOCATOR.call_once(|| {
        debug!(
            component = "workspace",
            event = "workspace.build_locator_registered",
            "Build-system locator registered"
        );
    });
}

/// The loaded compilation state: one live solution plus its service.
pub struct Workspace {
    pub solution: Mutex<Solution>,
    pub service: Arc<dyn EditContinuationService>,
}

pub struct WorkspaceHolder {
    loader: Arc<dyn ProjectLoader>,
    project_path: PathBuf,
    cell: OnceCell<Result<Arc<Workspace>, String>>,
}

impl WorkspaceHolder {
    pub fn new(loader: Arc<dyn ProjectLoader>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            project_path: project_path.into(),
            cell: OnceCell::new(),
        }
    }

    /// The workspace, loading it on first use. A failed load is remembered:
    /// every later call fails until the holder is recreated on the next
    /// iteration.
    pub async fn workspace(&self, cancel: &CancellationToken) -> anyhow::Result<Arc<Workspace>> {
        let entry = self
            .cell
            .get_or_init(|| async {
                register_build_locator();
                info!(
                    component = "workspace",
                    event = "workspace.loading",
                    project_path = %self.project_path.display(),
                    "Opening project"
                );
                match self.loader.load(&self.project_path, cancel).await {
                    Ok(loaded) => {
                        let documents: usize = loaded
                            .solution
                            .projects
                            .iter()
                            .map(|p| p.documents.len() + p.additional_documents.len())
                            .sum();
                        info!(
                            component = "workspace",
                            event = "workspace.loaded",
                            projects = loaded.solution.projects.len(),
                            documents,
                            "Project loaded, edit session service started"
                        );
                        Ok(Arc::new(Workspace {
                            solution: Mutex::new(loaded.solution),
                            service: loaded.service,
                        }))
                    }
                    Err(err) => {
                        warn!(
                            component = "workspace",
                            event = "workspace.load_failed",
                            project_path = %self.project_path.display(),
                            error = %err,
                            "Project load failed, hot reload degraded for this iteration"
                        );
                        Err(err.to_string())
                    }
                }
            })
            .await;

        match entry {
            Ok(workspace) => Ok(workspace.clone()),
            Err(message) => bail!("workspace initialization failed: {message}"),
        }
    }

    /// Release the workspace's compiler resources. Called before recreating
    /// the holder on an iteration boundary.
    pub fn dispose(&self) {
        if let Some(Ok(workspace)) = self.cell.get() {
            workspace.service.dispose();
            info!(
                component = "workspace",
                event = "workspace.disposed",
                project_path = %self.project_path.display(),
                "Workspace disposed"
            );
        }
    }
}
