use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::config::{PREVIEW_INTERVAL, PREVIEW_LAST_N};
use crate::paths::{BdgPaths, atomic_write_json};
use crate::telemetry::{SharedStore, SnapshotMode, emit_snapshot};

/// Periodic snapshot flusher: every tick it atomically writes the preview
/// snapshot (bounded, body-stripped) and the full snapshot (complete with
/// bodies).
///
/// A mutex guarantees at most one write in flight; a tick that finds the
/// previous write unfinished is skipped with a warning. `stop` halts the
/// timer and awaits any in-flight write before returning.
pub struct PreviewWriter {
    handle: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
    write_gate: Arc<Mutex<()>>,
}

impl PreviewWriter {
    /// Start the periodic flusher.
    #[must_use]
    pub fn start(store: SharedStore, paths: BdgPaths) -> Self {
        let write_gate = Arc::new(Mutex::new(()));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let gate = Arc::clone(&write_gate);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PREVIEW_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Ok(guard) = Arc::clone(&gate).try_lock_owned() else {
                            tracing::warn!("preview write still in flight, skipping tick");
                            continue;
                        };
                        spawn_write(&store, &paths, guard);
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Self {
            handle,
            stop_tx,
            write_gate,
        }
    }

    /// Stop the timer and await any in-flight write.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
        // Taking the gate proves the last write has completed.
        let _guard = self.write_gate.lock().await;
    }
}

/// Snapshot the store and flush both files off the async path. The owned
/// guard rides along so the gate is held for the write's whole lifetime.
fn spawn_write(
    store: &SharedStore,
    paths: &BdgPaths,
    guard: tokio::sync::OwnedMutexGuard<()>,
) {
    let (preview, full) = {
        let store = store.lock().expect("telemetry store poisoned");
        (
            emit_snapshot(&store, SnapshotMode::Preview, PREVIEW_LAST_N),
            emit_snapshot(&store, SnapshotMode::Full, PREVIEW_LAST_N),
        )
    };
    let preview_path = paths.session_preview();
    let full_path = paths.session_full();

    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        if let Err(e) = atomic_write_json(&preview_path, &preview) {
            tracing::warn!("preview snapshot write failed: {e}");
        }
        if let Err(e) = atomic_write_json(&full_path, &full) {
            tracing::warn!("full snapshot write failed: {e}");
        }
    });
}

/// Write the final `session.json` at shutdown.
///
/// # Errors
///
/// Returns the underlying session-file error so the caller can log it; the
/// rest of the shutdown sequence proceeds regardless.
pub fn write_final_snapshot(
    store: &SharedStore,
    paths: &BdgPaths,
    partial: bool,
) -> Result<(), crate::paths::SessionFileError> {
    let snapshot = {
        let store = store.lock().expect("telemetry store poisoned");
        emit_snapshot(&store, SnapshotMode::Final { partial }, PREVIEW_LAST_N)
    };
    atomic_write_json(&paths.session_final(), &snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TargetSummary, TelemetryKind, TelemetryStore};

    #[tokio::test]
    async fn final_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BdgPaths::at(dir.path());
        let store = TelemetryStore::shared(vec![TelemetryKind::Network], TargetSummary {
            url: "http://127.0.0.1:8080/".into(),
            title: "Test".into(),
        });

        write_final_snapshot(&store, &paths, false).unwrap();
        let written: serde_json::Value =
            crate::paths::read_json(&paths.session_final()).unwrap().unwrap();
        assert_eq!(written["partial"], false);
        assert_eq!(written["target"]["title"], "Test");

        write_final_snapshot(&store, &paths, true).unwrap();
        let written: serde_json::Value =
            crate::paths::read_json(&paths.session_final()).unwrap().unwrap();
        assert_eq!(written["partial"], true);
    }

    #[tokio::test]
    async fn stop_awaits_in_flight_writes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BdgPaths::at(dir.path());
        let store = TelemetryStore::shared(vec![], TargetSummary::default());

        let writer = PreviewWriter::start(store, paths);
        // Stop immediately; no tick has fired, and stop must not hang.
        tokio::time::timeout(std::time::Duration::from_secs(2), writer.stop())
            .await
            .expect("stop should complete promptly");
    }
}
