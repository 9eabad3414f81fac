//! Tool-side delta appliers
//!
//! One capability interface with two implementations, selected at
//! construction time from the project's target runtime: the pipe-backed
//! applier drives a request/response round with the in-process agent, and the
//! browser-refresh applier pushes the same payload shape over the refresh
//! channel without an ack.

use std::sync::Arc;

use async_trait::async_trait;
use cinder_protocol::{AckCode, DiagnosticsMessage, UpdateBatch, UpdatePayload};
use tracing::{debug, info, warn};

use crate::context::{TargetRuntime, WatchContext};
use crate::pipe::{PipeSend, PipeServer};
use crate::refresh::RefreshServer;

/// Capability interface over the applier variants.
#[async_trait]
pub trait DeltaApplier: Send + Sync {
    async fn initialize(&self, ctx: &WatchContext);

    /// Drive one update round. Returns whether the batch reached the target.
    async fn apply(&self, ctx: &WatchContext, batch: &UpdateBatch) -> bool;

    /// Forward formatted error diagnostics toward the target's surface.
    async fn report_diagnostics(&self, ctx: &WatchContext, diagnostics: &[String]);
}

/// Select the applier for the project's target runtime.
pub fn create_applier(
    runtime: TargetRuntime,
    pipe: Arc<PipeServer>,
    refresh: Option<RefreshServer>,
) -> Arc<dyn DeltaApplier> {
    match runtime {
        TargetRuntime::Process => Arc::new(PipeDeltaApplier::new(pipe)),
        TargetRuntime::Browser => Arc::new(BrowserRefreshApplier::new(refresh.unwrap_or_default())),
    }
}

// ---------------------------------------------------------------------------
// Pipe-backed applier
// ---------------------------------------------------------------------------

pub struct PipeDeltaApplier {
    pipe: Arc<PipeServer>,
}

impl PipeDeltaApplier {
    pub fn new(pipe: Arc<PipeServer>) -> Self {
        Self { pipe }
    }
}

#[async_trait]
impl DeltaApplier for PipeDeltaApplier {
    async fn initialize(&self, ctx: &WatchContext) {
        debug!(
            component = "applier",
            event = "applier.initialized",
            iteration = ctx.iteration,
            kind = "pipe",
            "Delta applier ready"
        );
    }

    async fn apply(&self, ctx: &WatchContext, batch: &UpdateBatch) -> bool {
        if !self.pipe.is_connected().await {
            // Non-agent-aware host; nothing to patch.
            debug!(
                component = "applier",
                event = "applier.no_client",
                "No agent connected, skipping apply"
            );
            return false;
        }

        let payload = UpdatePayload::for_pipe(&batch.updates);
        let sent = match self.pipe.send_update(&payload).await {
            Ok(sent) => sent,
            Err(err) => {
                warn!(
                    component = "applier",
                    event = "applier.encode_failed",
                    error = %err,
                    "Failed to encode update payload"
                );
                return false;
            }
        };

        match sent {
            // The agent detached between the check and the write.
            PipeSend::NoClient => false,
            PipeSend::Ack(ack) if ack.is_success() => {
                info!(
                    component = "applier",
                    event = "applier.applied",
                    updates = batch.updates.len(),
                    ack = ?ack,
                    "Update batch applied"
                );
                if let Some(refresh) = &ctx.browser_refresh {
                    refresh.reload();
                }
                true
            }
            PipeSend::Ack(ack) => {
                warn!(
                    component = "applier",
                    event = "applier.apply_failed",
                    ack = ?ack,
                    "Agent reported apply failure"
                );
                false
            }
        }
    }

    async fn report_diagnostics(&self, ctx: &WatchContext, diagnostics: &[String]) {
        // The pipe carries updates only; diagnostics go to the refresh
        // channel when one is attached.
        if let Some(refresh) = &ctx.browser_refresh {
            refresh.send_json(&DiagnosticsMessage::new(diagnostics.to_vec()));
        }
    }
}

// ---------------------------------------------------------------------------
// Browser-refresh applier
// ---------------------------------------------------------------------------

/// For browser-hosted runtimes: the payload travels the refresh channel and
/// success is reported optimistically, with no ack.
pub struct BrowserRefreshApplier {
    refresh: RefreshServer,
}

impl BrowserRefreshApplier {
    pub fn new(refresh: RefreshServer) -> Self {
        Self { refresh }
    }
}

#[async_trait]
impl DeltaApplier for BrowserRefreshApplier {
    async fn initialize(&self, ctx: &WatchContext) {
        debug!(
            component = "applier",
            event = "applier.initialized",
            iteration = ctx.iteration,
            kind = "browser",
            "Delta applier ready"
        );
    }

    async fn apply(&self, _ctx: &WatchContext, batch: &UpdateBatch) -> bool {
        self.refresh
            .send_json(&UpdatePayload::for_browser(&batch.updates));
        info!(
            component = "applier",
            event = "applier.pushed_to_browser",
            updates = batch.updates.len(),
            "Update batch pushed over refresh channel"
        );
        true
    }

    async fn report_diagnostics(&self, _ctx: &WatchContext, diagnostics: &[String]) {
        self.refresh
            .send_json(&DiagnosticsMessage::new(diagnostics.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessSpec;
    use cinder_protocol::ModuleUpdate;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use uuid::Uuid;

    fn test_context() -> WatchContext {
        WatchContext::new("/work/app", ProcessSpec::new("app", "/work/app"))
    }

    fn ready_batch() -> UpdateBatch {
        UpdateBatch::ready(vec![ModuleUpdate {
            module_id: Uuid::new_v4(),
            metadata_delta: vec![1],
            il_delta: vec![2],
        }])
    }

    async fn wait_connected(pipe: &PipeServer) {
        while !pipe.is_connected().await {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn apply_without_agent_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = Arc::new(PipeServer::bind(&dir.path().join("pipe")).unwrap());
        let applier = PipeDeltaApplier::new(pipe);

        assert!(!applier.apply(&test_context(), &ready_batch()).await);
    }

    #[tokio::test]
    async fn successful_ack_applies_and_reloads_the_browser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let pipe = Arc::new(PipeServer::bind(&path).unwrap());

        let client = UnixStream::connect(&path).await.unwrap();
        wait_connected(&pipe).await;
        let (read_half, mut write_half) = client.into_split();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(&[AckCode::Success.wire_byte().unwrap()])
                .await
                .unwrap();
        });

        let refresh = RefreshServer::new();
        let mut refresh_rx = refresh.subscribe();
        let ctx = test_context().with_browser_refresh(refresh);

        let applier = PipeDeltaApplier::new(pipe);
        assert!(applier.apply(&ctx, &ready_batch()).await);

        let raw = refresh_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "Reload");
    }

    #[tokio::test]
    async fn failed_ack_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let pipe = Arc::new(PipeServer::bind(&path).unwrap());

        let client = UnixStream::connect(&path).await.unwrap();
        wait_connected(&pipe).await;
        let (read_half, mut write_half) = client.into_split();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(&[AckCode::Failed.wire_byte().unwrap()])
                .await
                .unwrap();
        });

        let applier = PipeDeltaApplier::new(pipe);
        assert!(!applier.apply(&test_context(), &ready_batch()).await);
    }

    #[tokio::test]
    async fn browser_applier_pushes_the_tagged_payload() {
        let refresh = RefreshServer::new();
        let mut rx = refresh.subscribe();
        let applier = BrowserRefreshApplier::new(refresh);

        assert!(applier.apply(&test_context(), &ready_batch()).await);

        let raw = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "HotReloadDelta");
        assert_eq!(value["deltas"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn browser_applier_forwards_diagnostics() {
        let refresh = RefreshServer::new();
        let mut rx = refresh.subscribe();
        let applier = BrowserRefreshApplier::new(refresh);

        applier
            .report_diagnostics(&test_context(), &["app: error: CS0103".to_string()])
            .await;

        let raw = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "HotReloadDiagnosticsv1");
    }
}
