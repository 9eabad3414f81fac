//! File-change watching
//!
//! Thin driver between the filesystem watcher and the edit-session driver:
//! raw notify events are debounced per path so editor write bursts collapse
//! into one change each, then surfaced on a single channel the watch loop
//! drains serially.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEBOUNCE_MS: u64 = 150;

pub struct ChangeWatcher {
    rx: mpsc::UnboundedReceiver<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    /// Watch `root` recursively and emit debounced changed paths.
    pub fn start(root: &Path) -> anyhow::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !matches_supported_event_kind(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(err) => {
                    warn!(
                        component = "watch",
                        event = "watch.fs_event_error",
                        error = %err,
                        "File watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_loop(raw_rx, tx));

        info!(
            component = "watch",
            event = "watch.started",
            path = %root.display(),
            "File watcher started"
        );

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    /// Next debounced change; `None` when the watcher shut down.
    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    tx: mpsc::UnboundedSender<PathBuf>,
) {
    let mut pending: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();

    while let Some(path) = raw_rx.recv().await {
        if let Some(handle) = pending.remove(&path) {
            handle.abort();
        }

        let tx = tx.clone();
        let debounced = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            let _ = tx.send(debounced);
        });
        pending.insert(path, handle);
    }
}
