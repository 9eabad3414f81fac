//! Edit-session driver
//!
//! Turns one changed file into at most one applied update batch. The whole
//! handle runs under the workspace's solution lock, which serializes change
//! handling and guarantees at most one open edit session. Returning `false`
//! tells the outer loop the change could not be hot-applied and it may choose
//! to restart the iteration.

use std::path::Path;
use std::sync::Arc;

use cinder_protocol::UpdateStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::applier::DeltaApplier;
use crate::compile::EditSession;
use crate::context::WatchContext;
use crate::diagnostics::DiagnosticsRouter;
use crate::fs_read::read_with_retries;
use crate::solution::DocumentKind;
use crate::workspace::WorkspaceHolder;

/// File extensions the driver can hot-apply. Everything else is not handled
/// and left to the outer loop.
pub const DEFAULT_SOURCE_EXTENSIONS: &[&str] = &["cs", "razor"];

pub struct EditSessionDriver {
    holder: Arc<WorkspaceHolder>,
    applier: Arc<dyn DeltaApplier>,
    diagnostics: DiagnosticsRouter,
    extensions: Vec<String>,
}

impl EditSessionDriver {
    pub fn new(
        holder: Arc<WorkspaceHolder>,
        applier: Arc<dyn DeltaApplier>,
        diagnostics: DiagnosticsRouter,
    ) -> Self {
        Self {
            holder,
            applier,
            diagnostics,
            extensions: DEFAULT_SOURCE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|ext| ext.to_string()).collect();
        self
    }

    /// Pre-filter: only configured source extensions are processable.
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|known| known == ext))
            .unwrap_or(false)
    }

    /// Handle one changed file. Returns whether the change was handled
    /// without requiring a restart.
    pub async fn handle_file_change(
        &self,
        ctx: &WatchContext,
        path: &Path,
        cancel: &CancellationToken,
    ) -> bool {
        let workspace = match self.holder.workspace(cancel).await {
            Ok(workspace) => workspace,
            Err(err) => {
                warn!(
                    component = "driver",
                    event = "driver.workspace_unavailable",
                    path = %path.display(),
                    error = %err,
                    "Workspace unavailable, change not handled"
                );
                return false;
            }
        };

        let text = match read_with_retries(path, cancel).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    component = "driver",
                    event = "driver.read_failed",
                    path = %path.display(),
                    error = %err,
                    "Changed file never became readable"
                );
                return false;
            }
        };

        // Holding the lock for the whole handle serializes change handling
        // and keeps the single-open-session invariant.
        let mut current = workspace.solution.lock().await;

        let Some(located) = current.locate(path) else {
            debug!(
                component = "driver",
                event = "driver.document_unknown",
                path = %path.display(),
                "Changed file is not part of the solution"
            );
            return false;
        };

        let updated = match located.kind {
            DocumentKind::Primary => current.with_document_text(&located.document_id, text),
            DocumentKind::Additional => {
                current.with_additional_document_text(&located.document_id, text)
            }
        };

        let session = EditSession::begin(workspace.service.clone());
        let batch = match workspace.service.emit_update(&updated, cancel).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    component = "driver",
                    event = "driver.emit_failed",
                    path = %path.display(),
                    error = %err,
                    "Edit-continuation emit failed"
                );
                session.discard();
                return false;
            }
        };

        match batch.status {
            // No observable change. If the project currently has compiler
            // errors the user is mid-edit; surface them but treat the change
            // as handled so the outer loop does not restart on a transient
            // syntactic gap.
            UpdateStatus::None | UpdateStatus::Ready if batch.is_empty() => {
                session.discard();
                debug!(
                    component = "driver",
                    event = "driver.no_update",
                    path = %path.display(),
                    "Change produced no update"
                );

                match workspace
                    .service
                    .compilation_diagnostics(&updated, &located.project_id, cancel)
                    .await
                {
                    Ok(diagnostics) => {
                        self.diagnostics.route(&diagnostics);
                    }
                    Err(err) => {
                        warn!(
                            component = "driver",
                            event = "driver.diagnostics_failed",
                            error = %err,
                            "Failed to collect compiler diagnostics"
                        );
                    }
                }
                true
            }

            UpdateStatus::Ready => {
                session.commit();
                *current = updated;
                drop(current);

                debug!(
                    component = "driver",
                    event = "driver.batch_ready",
                    path = %path.display(),
                    updates = batch.updates.len(),
                    "Update batch committed, applying"
                );
                self.applier.apply(ctx, &batch).await
            }

            // Rude edit or hard compilation error: surface diagnostics and
            // let the outer loop decide to restart.
            UpdateStatus::Blocked => {
                session.discard();
                let errors = self.diagnostics.route(&batch.diagnostics);
                warn!(
                    component = "driver",
                    event = "driver.batch_blocked",
                    path = %path.display(),
                    errors = errors.len(),
                    "Update blocked, restart required"
                );
                false
            }

            // Ready with updates is handled above; this arm is the
            // non-empty None case, which cannot occur.
            UpdateStatus::None => unreachable!("None status carries no updates"),
        }
    }
}
