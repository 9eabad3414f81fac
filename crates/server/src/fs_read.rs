//! Source reads that tolerate the watcher-vs-writer race
//!
//! File watchers routinely fire before the editor has released its write
//! handle, so a plain read right after the event often fails or sees a
//! truncated file. Reads go through a short initial delay and a bounded retry
//! loop instead.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(20);
const RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 10;

/// Read a changed source file, retrying while the writer still holds it.
///
/// Sleeps 20 ms before the first attempt, then tries up to 10 opens with
/// 100 ms between them. I/O errors are swallowed on every attempt but the
/// last; the final failure surfaces as a hard read error. Worst case spans
/// roughly 920 ms.
pub async fn read_with_retries(path: &Path, cancel: &CancellationToken) -> anyhow::Result<String> {
    sleep_cancellable(INITIAL_DELAY, cancel).await?;

    for attempt in 1..=MAX_ATTEMPTS {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => return Ok(text),
            Err(err) if attempt < MAX_ATTEMPTS => {
                debug!(
                    component = "fs_read",
                    event = "fs_read.retry",
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "Source not readable yet, retrying"
                );
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        }
        sleep_cancellable(RETRY_DELAY, cancel).await?;
    }

    unreachable!("final read attempt either returns or errors")
}

async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("file read cancelled"),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
