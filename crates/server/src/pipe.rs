//! Local update channel, server half
//!
//! A Unix domain socket with the well-known hot-reload name, restricted to
//! the current user (0700 parent, 0600 socket). Strictly single-client: the
//! agent inside the target process opens the client half during startup; a
//! second client connecting while one is registered is dropped, which it
//! observes as EOF. Framing is JSON documents back-to-back; every payload is
//! answered by exactly one ack byte before the next is written.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use cinder_protocol::{encode_line, AckCode, UpdatePayload, PIPE_NAME};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the tool waits for the agent's ack before synthesizing a timeout.
/// Long enough for typical applies, short enough to keep the edit loop live.
pub const ACK_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    AwaitingClient,
    Connected,
    Closed,
}

/// Outcome of writing one update payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSend {
    /// No agent is attached; nothing was written.
    NoClient,
    /// The payload was written; this is the (possibly synthesized) ack.
    Ack(AckCode),
}

struct PipeShared {
    conn: Mutex<Option<UnixStream>>,
    state: StdMutex<ChannelState>,
}

impl PipeShared {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Server half of the update channel. Owned by the tool; rebuilt each
/// iteration.
pub struct PipeServer {
    path: PathBuf,
    shared: Arc<PipeShared>,
    accept_cancel: CancellationToken,
}

impl PipeServer {
    /// Socket path for the well-known channel name in the per-user runtime
    /// directory.
    pub fn default_path() -> PathBuf {
        let dir = std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("cinder"))
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
                PathBuf::from(home).join(".cinder").join("run")
            });
        dir.join(PIPE_NAME)
    }

    /// Bind the socket and start accepting. At most one client is registered
    /// at a time; extras are dropped on arrival.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create pipe dir {}", parent.display()))?;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind update channel at {}", path.display()))?;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));

        let shared = Arc::new(PipeShared {
            conn: Mutex::new(None),
            state: StdMutex::new(ChannelState::AwaitingClient),
        });
        let accept_cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            accept_cancel.clone(),
        ));

        info!(
            component = "pipe",
            event = "pipe.listening",
            path = %path.display(),
            "Update channel awaiting agent"
        );

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            accept_cancel,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock().unwrap()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.conn.lock().await.is_some()
    }

    /// Write one payload and read its ack byte under the 2-second deadline.
    ///
    /// Returns `NoClient` without touching the wire when no agent is
    /// attached. Timeouts and I/O failures synthesize `AckCode::TimedOut`;
    /// a plain timeout leaves the connection usable for the next batch.
    pub async fn send_update(&self, payload: &UpdatePayload) -> anyhow::Result<PipeSend> {
        let mut guard = self.shared.conn.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Ok(PipeSend::NoClient);
        };

        let line = encode_line(payload)?;
        if let Err(err) = write_payload(stream, line.as_bytes()).await {
            warn!(
                component = "pipe",
                event = "pipe.write_failed",
                error = %err,
                "Agent connection lost while writing update"
            );
            guard.take();
            self.shared.set_state(ChannelState::Disconnected);
            return Ok(PipeSend::Ack(AckCode::TimedOut));
        }

        match tokio::time::timeout(ACK_DEADLINE, stream.read_u8()).await {
            Ok(Ok(byte)) => match AckCode::from_wire_byte(byte) {
                Some(ack) => Ok(PipeSend::Ack(ack)),
                None => {
                    warn!(
                        component = "pipe",
                        event = "pipe.bad_ack",
                        byte,
                        "Agent sent an unknown ack byte"
                    );
                    Ok(PipeSend::Ack(AckCode::Failed))
                }
            },
            Ok(Err(err)) => {
                warn!(
                    component = "pipe",
                    event = "pipe.read_failed",
                    error = %err,
                    "Agent connection lost while awaiting ack"
                );
                guard.take();
                self.shared.set_state(ChannelState::Disconnected);
                Ok(PipeSend::Ack(AckCode::TimedOut))
            }
            Err(_) => {
                warn!(
                    component = "pipe",
                    event = "pipe.ack_timeout",
                    deadline_ms = ACK_DEADLINE.as_millis() as u64,
                    "Agent did not ack within the deadline"
                );
                Ok(PipeSend::Ack(AckCode::TimedOut))
            }
        }
    }

    /// Close the channel: stop accepting, drop the client (it observes EOF),
    /// and remove the socket file.
    pub async fn close(&self) {
        self.accept_cancel.cancel();
        self.shared.conn.lock().await.take();
        self.shared.set_state(ChannelState::Closed);
        let _ = std::fs::remove_file(&self.path);
        debug!(
            component = "pipe",
            event = "pipe.closed",
            path = %self.path.display(),
            "Update channel closed"
        );
    }
}

async fn write_payload(stream: &mut UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<PipeShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let mut conn = shared.conn.lock().await;
                    if conn.is_some() {
                        // The existing connection is preserved; the extra
                        // client sees EOF on its next read.
                        warn!(
                            component = "pipe",
                            event = "pipe.client_refused",
                            "Second agent connection refused"
                        );
                        drop(stream);
                        continue;
                    }
                    *conn = Some(stream);
                    shared.set_state(ChannelState::Connected);
                    info!(
                        component = "pipe",
                        event = "pipe.client_connected",
                        "Agent connected to update channel"
                    );
                }
                Err(err) => {
                    warn!(
                        component = "pipe",
                        event = "pipe.accept_failed",
                        error = %err,
                        "Accept on update channel failed"
                    );
                }
            },
        }
    }
}
