//! Agent loop
//!
//! Connects to the watch tool's update channel with a bounded timeout, then
//! loops: read one payload document, apply every delta best-effort through
//! the runtime seam, write the ack byte. Within a batch deltas attempt
//! independently; any failure makes the final ack `Failed`. A disconnect or
//! unrecoverable read error exits the loop cleanly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cinder_protocol::{decode_payload, AckCode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{ModuleRegistry, RuntimeUpdater};

pub use cinder_protocol::PIPE_ENV_VAR;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    Exited,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub pipe_path: PathBuf,
    pub connect_timeout: Duration,
    /// Ack `Success+Refresh` instead of `Success` when the host wants the
    /// tool to also refresh the browser.
    pub refresh_on_success: bool,
}

impl AgentConfig {
    pub fn new(pipe_path: impl Into<PathBuf>) -> Self {
        Self {
            pipe_path: pipe_path.into(),
            connect_timeout: CONNECT_TIMEOUT,
            refresh_on_success: false,
        }
    }

    /// Configuration from the launch environment; `None` when the host was
    /// started without the hot-reload channel entry.
    pub fn from_env() -> Option<Self> {
        std::env::var(PIPE_ENV_VAR).ok().map(Self::new)
    }
}

/// Handle onto the agent's background task.
pub struct AgentHandle {
    state_rx: watch::Receiver<AgentState>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Wait until the agent reaches `state`.
    pub async fn wait_for(&mut self, state: AgentState) {
        while *self.state_rx.borrow() != state {
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the background task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub(crate) fn spawn(
    config: AgentConfig,
    registry: Arc<ModuleRegistry>,
    updater: Arc<dyn RuntimeUpdater>,
) -> AgentHandle {
    let (state_tx, state_rx) = watch::channel(AgentState::Connecting);
    let task = tokio::spawn(run(config, registry, updater, state_tx));
    AgentHandle { state_rx, task }
}

async fn run(
    config: AgentConfig,
    registry: Arc<ModuleRegistry>,
    updater: Arc<dyn RuntimeUpdater>,
    state_tx: watch::Sender<AgentState>,
) {
    let stream = match connect_with_timeout(&config.pipe_path, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                component = "agent",
                event = "agent.connect_failed",
                path = %config.pipe_path.display(),
                error = %err,
                "Could not reach the update channel"
            );
            let _ = state_tx.send(AgentState::Exited);
            return;
        }
    };

    let _ = state_tx.send(AgentState::Connected);
    info!(
        component = "agent",
        event = "agent.connected",
        path = %config.pipe_path.display(),
        modules = registry.len(),
        "Agent connected to update channel"
    );

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF: the tool closed the channel.
            Ok(None) => break,
            Err(err) => {
                warn!(
                    component = "agent",
                    event = "agent.read_failed",
                    error = %err,
                    "Update channel read failed"
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let ack = apply_payload(&line, &registry, updater.as_ref(), config.refresh_on_success);
        let byte = ack.wire_byte().unwrap_or(0);
        if write_half.write_all(&[byte]).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }

    let _ = state_tx.send(AgentState::Exited);
    info!(
        component = "agent",
        event = "agent.exited",
        "Agent loop exited"
    );
}

/// Apply one payload. Best-effort across deltas: every delta attempts, and
/// any failure turns the final ack into `Failed`. Failures never unwind into
/// the host.
fn apply_payload(
    line: &str,
    registry: &ModuleRegistry,
    updater: &dyn RuntimeUpdater,
    refresh_on_success: bool,
) -> AckCode {
    let payload = match decode_payload(line) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(
                component = "agent",
                event = "agent.bad_payload",
                error = %err,
                "Rejected malformed update payload"
            );
            return AckCode::Failed;
        }
    };

    let mut failed = false;
    for delta in &payload.deltas {
        let Some(module) = registry.resolve(delta.module_id) else {
            // The module may simply not be loaded in this process.
            debug!(
                component = "agent",
                event = "agent.module_not_loaded",
                module_id = %delta.module_id,
                "No loaded module for delta, skipping"
            );
            continue;
        };

        match updater.apply_update(&module, &delta.metadata_delta, &delta.il_delta, &[]) {
            Ok(()) => {
                debug!(
                    component = "agent",
                    event = "agent.delta_applied",
                    module_id = %delta.module_id,
                    module = %module.name,
                    "Delta applied"
                );
            }
            Err(err) => {
                warn!(
                    component = "agent",
                    event = "agent.delta_failed",
                    module_id = %delta.module_id,
                    module = %module.name,
                    error = %err,
                    "Runtime rejected delta"
                );
                failed = true;
            }
        }
    }

    if failed {
        AckCode::Failed
    } else if refresh_on_success {
        AckCode::SuccessAndRefresh
    } else {
        AckCode::Success
    }
}

async fn connect_with_timeout(path: &Path, timeout: Duration) -> std::io::Result<UnixStream> {
    tokio::time::timeout(timeout, async {
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return stream,
                Err(err) => {
                    debug!(
                        component = "agent",
                        event = "agent.connect_retry",
                        error = %err,
                        "Update channel not ready, retrying"
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    })
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no update channel within {timeout:?}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LoadedModule, UpdateError};
    use cinder_protocol::{encode_line, ModuleUpdate, UpdatePayload};
    use std::sync::Mutex;
    use tokio::net::UnixListener;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingUpdater {
        applied: Mutex<Vec<(Uuid, Vec<u8>, Vec<u8>)>>,
        fail_for: Option<Uuid>,
    }

    impl RecordingUpdater {
        fn failing_for(id: Uuid) -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
                fail_for: Some(id),
            }
        }

        fn applied(&self) -> Vec<(Uuid, Vec<u8>, Vec<u8>)> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl RuntimeUpdater for RecordingUpdater {
        fn apply_update(
            &self,
            module: &LoadedModule,
            metadata_delta: &[u8],
            il_delta: &[u8],
            _pdb_delta: &[u8],
        ) -> Result<(), UpdateError> {
            self.applied.lock().unwrap().push((
                module.id,
                metadata_delta.to_vec(),
                il_delta.to_vec(),
            ));
            if self.fail_for == Some(module.id) {
                return Err(UpdateError::Rejected("bad IL".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        handle: AgentHandle,
        tool: UnixStream,
        updater: Arc<RecordingUpdater>,
        _dir: tempfile::TempDir,
    }

    /// Stand up a fake tool endpoint and a connected agent.
    async fn harness(registry: ModuleRegistry, updater: RecordingUpdater) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let listener = UnixListener::bind(&path).unwrap();

        let updater = Arc::new(updater);
        let mut handle = initialize_agent(&path, registry, updater.clone());

        let (tool, _addr) = listener.accept().await.unwrap();
        handle.wait_for(AgentState::Connected).await;

        Harness {
            handle,
            tool,
            updater,
            _dir: dir,
        }
    }

    fn initialize_agent(
        path: &Path,
        registry: ModuleRegistry,
        updater: Arc<RecordingUpdater>,
    ) -> AgentHandle {
        crate::initialize(AgentConfig::new(path), Arc::new(registry), updater)
    }

    async fn send_updates(tool: &mut UnixStream, updates: &[ModuleUpdate]) -> AckCode {
        let line = encode_line(&UpdatePayload::for_pipe(updates)).unwrap();
        tool.write_all(line.as_bytes()).await.unwrap();
        read_ack(tool).await
    }

    async fn read_ack(tool: &mut UnixStream) -> AckCode {
        use tokio::io::AsyncReadExt;
        let byte = tool.read_u8().await.unwrap();
        AckCode::from_wire_byte(byte).unwrap()
    }

    fn update_for(id: Uuid, tag: u8) -> ModuleUpdate {
        ModuleUpdate {
            module_id: id,
            metadata_delta: vec![tag, 1],
            il_delta: vec![tag, 2],
        }
    }

    #[tokio::test]
    async fn applies_delta_and_acks_success() {
        let id = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(id, "WebApp.dll"));
        let mut hx = harness(registry, RecordingUpdater::default()).await;

        let ack = send_updates(&mut hx.tool, &[update_for(id, 7)]).await;

        assert_eq!(ack, AckCode::Success);
        let applied = hx.updater.applied();
        assert_eq!(applied, vec![(id, vec![7, 1], vec![7, 2])]);
    }

    #[tokio::test]
    async fn deltas_apply_in_array_order_across_batches() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(first, "A.dll"));
        registry.register(LoadedModule::new(second, "B.dll"));
        let mut hx = harness(registry, RecordingUpdater::default()).await;

        let ack = send_updates(&mut hx.tool, &[update_for(first, 1), update_for(second, 2)]).await;
        assert_eq!(ack, AckCode::Success);
        let ack = send_updates(&mut hx.tool, &[update_for(first, 3)]).await;
        assert_eq!(ack, AckCode::Success);

        let order: Vec<Uuid> = hx.updater.applied().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(order, vec![first, second, first]);
    }

    #[tokio::test]
    async fn one_failing_delta_fails_the_batch_but_all_attempt() {
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(good, "A.dll"));
        registry.register(LoadedModule::new(bad, "B.dll"));
        let mut hx = harness(registry, RecordingUpdater::failing_for(bad)).await;

        let ack = send_updates(&mut hx.tool, &[update_for(bad, 1), update_for(good, 2)]).await;

        assert_eq!(ack, AckCode::Failed);
        // Best-effort: the good delta was still attempted.
        assert_eq!(hx.updater.applied().len(), 2);
    }

    #[tokio::test]
    async fn unloaded_module_is_skipped_without_failing() {
        let registry = ModuleRegistry::new();
        let mut hx = harness(registry, RecordingUpdater::default()).await;

        let ack = send_updates(&mut hx.tool, &[update_for(Uuid::new_v4(), 1)]).await;

        assert_eq!(ack, AckCode::Success);
        assert!(hx.updater.applied().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_fails_only_its_batch() {
        let id = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(id, "A.dll"));
        let mut hx = harness(registry, RecordingUpdater::default()).await;

        hx.tool.write_all(b"not json\n").await.unwrap();
        assert_eq!(read_ack(&mut hx.tool).await, AckCode::Failed);

        // The channel stays usable for the next batch.
        let ack = send_updates(&mut hx.tool, &[update_for(id, 9)]).await;
        assert_eq!(ack, AckCode::Success);
    }

    #[tokio::test]
    async fn empty_delta_bytes_are_a_protocol_fault() {
        let id = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(id, "A.dll"));
        let mut hx = harness(registry, RecordingUpdater::default()).await;

        let line = format!(
            "{{\"deltas\":[{{\"moduleId\":\"{id}\",\"metadataDelta\":\"\",\"ilDelta\":\"\"}}]}}\n"
        );
        hx.tool.write_all(line.as_bytes()).await.unwrap();

        assert_eq!(read_ack(&mut hx.tool).await, AckCode::Failed);
        assert!(hx.updater.applied().is_empty());
    }

    #[tokio::test]
    async fn refresh_hint_acks_success_and_refresh() {
        let id = Uuid::new_v4();
        let registry = ModuleRegistry::new();
        registry.register(LoadedModule::new(id, "A.dll"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let listener = UnixListener::bind(&path).unwrap();

        let mut config = AgentConfig::new(&path);
        config.refresh_on_success = true;
        let mut handle = crate::initialize(
            config,
            Arc::new(registry),
            Arc::new(RecordingUpdater::default()),
        );
        let (mut tool, _addr) = listener.accept().await.unwrap();
        handle.wait_for(AgentState::Connected).await;

        let ack = send_updates(&mut tool, &[update_for(id, 1)]).await;
        assert_eq!(ack, AckCode::SuccessAndRefresh);
    }

    #[tokio::test]
    async fn server_close_exits_the_loop_cleanly() {
        let registry = ModuleRegistry::new();
        let hx = harness(registry, RecordingUpdater::default()).await;

        drop(hx.tool);
        hx.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_channel_times_out_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-pipe");

        let mut handle = initialize_agent(
            &path,
            ModuleRegistry::new(),
            Arc::new(RecordingUpdater::default()),
        );

        handle.wait_for(AgentState::Exited).await;
    }
}
