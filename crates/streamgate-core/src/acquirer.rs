use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::engine::{SwarmStats, TorrentEngine};
use crate::error::{Error, Result};
use crate::registry::{Registry, StreamStatus};
use crate::selection::{CandidateFile, select_video_file};

const STALL_RECOVERY_TICKS: u32 = 3;
const DEAD_TORRENT_TICKS: u32 = 6;

struct Session {
    torrent: Arc<dyn crate::engine::RunningTorrent>,
    selected_file: CandidateFile,
    cancel: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Wraps a `TorrentEngine`: starts it against a magnet URI, applies the file-selection
/// policy, and runs a per-stream watchdog that detects stalls and dead swarms. Owns one
/// `Session` per stream, keyed by stream ID — never referenced by pointer from elsewhere.
pub struct Acquirer {
    engine: Arc<dyn TorrentEngine>,
    registry: Arc<Registry>,
    watchdog_tick: Duration,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

fn validate_magnet(magnet_uri: &str) -> Result<()> {
    if !magnet_uri.starts_with("magnet:") || !magnet_uri.contains("xt=urn:btih:") {
        return Err(Error::InvalidInput(
            "magnet URI must start with magnet: and contain xt=urn:btih:".to_string(),
        ));
    }
    Ok(())
}

impl Acquirer {
    pub fn new(engine: Arc<dyn TorrentEngine>, registry: Arc<Registry>, watchdog_tick: Duration) -> Self {
        Self {
            engine,
            registry,
            watchdog_tick,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begins acquisition for `stream_id`. Preconditions: the registry already holds
    /// `stream_id` in `Initializing`. On success the registry transitions to `Downloading`.
    pub async fn start(
        &self,
        stream_id: Uuid,
        magnet_uri: &str,
        output_dir: &std::path::Path,
    ) -> Result<CandidateFile> {
        validate_magnet(magnet_uri)?;

        let torrent = self
            .engine
            .start(magnet_uri, output_dir)
            .await
            .map_err(Error::EngineError)?;

        let files = torrent.files();
        let candidates: Vec<CandidateFile> = files;
        let selected = select_video_file(&candidates)
            .cloned()
            .ok_or(Error::NoMedia)?;

        if let Err(e) = torrent.select_file(selected.index) {
            return Err(Error::EngineError(e));
        }
        for file in &candidates {
            if file.index == selected.index {
                continue;
            }
            if let Err(e) = torrent.deselect_file(file.index) {
                warn!(stream_id=%stream_id, file=file.index, error=%e, "deselect not supported, tolerating");
            }
        }

        let cancel = CancellationToken::new();
        let session = Arc::new(Session {
            torrent: torrent.clone(),
            selected_file: selected.clone(),
            cancel: cancel.clone(),
            watchdog: Mutex::new(None),
        });

        self.sessions.lock().insert(stream_id, session.clone());
        self.registry
            .update_status(stream_id, StreamStatus::Downloading, None);

        let handle = tokio::spawn(
            watchdog_loop(
                stream_id,
                torrent,
                self.registry.clone(),
                cancel,
                self.watchdog_tick,
            )
            .instrument(tracing::info_span!("watchdog", stream_id = %stream_id)),
        );
        *session.watchdog.lock() = Some(handle);

        Ok(selected)
    }

    /// Current overall download percentage for `stream_id`, or 0 if unknown/not started.
    pub fn progress(&self, stream_id: Uuid) -> u8 {
        let sessions = self.sessions.lock();
        let Some(session) = sessions.get(&stream_id) else {
            return 0;
        };
        let stats = session.torrent.stats();
        percent(stats.downloaded_bytes, stats.total_length)
    }

    /// The file the selection policy chose for `stream_id`, if acquisition has started.
    pub fn selected_file(&self, stream_id: Uuid) -> Option<CandidateFile> {
        self.sessions
            .lock()
            .get(&stream_id)
            .map(|s| s.selected_file.clone())
    }

    /// Engine-reported bytes downloaded for the selected file specifically, the second
    /// readiness signal behind on-disk size.
    pub fn file_downloaded_bytes(&self, stream_id: Uuid) -> u64 {
        let sessions = self.sessions.lock();
        let Some(session) = sessions.get(&stream_id) else {
            return 0;
        };
        session
            .torrent
            .file_downloaded_bytes(session.selected_file.index)
    }

    /// Swarm-wide stats (peers, speed, totals) for `stream_id`, or zeroed defaults if the
    /// session is unknown.
    pub fn swarm_stats(&self, stream_id: Uuid) -> SwarmStats {
        self.sessions
            .lock()
            .get(&stream_id)
            .map(|s| s.torrent.stats())
            .unwrap_or_default()
    }

    /// Idempotent: destroys the engine and drops the session entry.
    pub async fn cleanup(&self, stream_id: Uuid) {
        let session = self.sessions.lock().remove(&stream_id);
        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        if let Some(handle) = session.watchdog.lock().take() {
            handle.abort();
        }
        if let Err(e) = session.torrent.destroy().await {
            warn!(stream_id=%stream_id, error=%e, "error destroying torrent engine, ignoring");
        }
    }
}

fn percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    pct as u8
}

async fn watchdog_loop(
    stream_id: Uuid,
    torrent: Arc<dyn crate::engine::RunningTorrent>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    tick: Duration,
) {
    // `total_stalled_ticks` tracks consecutive stalled ticks since the last real progress and
    // is never reset by a recovery attempt, only by progress; it alone decides dead-torrent.
    // `recovery_ticks` drives the every-3rd-tick pause/resume attempt and resets on each one.
    let mut total_stalled_ticks: u32 = 0;
    let mut recovery_ticks: u32 = 0;
    let mut last_downloaded: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(stream_id=%stream_id, "watchdog cancelled");
                return;
            }
            _ = tokio::time::sleep(tick) => {}
        }

        let stats: SwarmStats = torrent.stats();
        let previous = last_downloaded;
        last_downloaded = stats.downloaded_bytes;

        if stats.downloaded_bytes <= previous {
            total_stalled_ticks += 1;
            recovery_ticks += 1;

            if total_stalled_ticks >= DEAD_TORRENT_TICKS && stats.connected_peers == 0 {
                info!(stream_id=%stream_id, "torrent appears dead, no peers after {} stalled ticks", total_stalled_ticks);
                registry.update_status(
                    stream_id,
                    StreamStatus::Error,
                    Some("torrent appears to be dead (no peers found)".to_string()),
                );
                let _ = torrent.destroy().await;
                return;
            }

            if recovery_ticks >= STALL_RECOVERY_TICKS && recovery_ticks % STALL_RECOVERY_TICKS == 0 {
                warn!(stream_id=%stream_id, total_stalled_ticks, "stalled, attempting pause/resume recovery");
                if torrent.pause().await.is_ok() {
                    let _ = torrent.resume().await;
                }
                recovery_ticks = 0;
            }
        } else {
            total_stalled_ticks = 0;
            recovery_ticks = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, FakeTorrent};

    fn mp4_files() -> Vec<CandidateFile> {
        vec![CandidateFile {
            index: 0,
            relative_path: "movie.mp4".into(),
            length: 20 * 1024 * 1024,
        }]
    }

    #[tokio::test]
    async fn start_rejects_invalid_magnet() {
        let registry = Arc::new(Registry::new());
        let engine = Arc::new(FakeEngine {
            torrent: Arc::new(FakeTorrent::new(mp4_files(), SwarmStats::default())),
        });
        let acquirer = Acquirer::new(engine, registry, Duration::from_millis(10));
        let err = acquirer
            .start(Uuid::new_v4(), "not-a-magnet", std::path::Path::new("/tmp"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn start_transitions_to_downloading() {
        let registry = Arc::new(Registry::new());
        let stream = registry.create("magnet:?xt=urn:btih:abc");
        let engine = Arc::new(FakeEngine {
            torrent: Arc::new(FakeTorrent::new(mp4_files(), SwarmStats::default())),
        });
        let acquirer = Acquirer::new(engine, registry.clone(), Duration::from_millis(10));
        let selected = acquirer
            .start(stream.id, "magnet:?xt=urn:btih:abc", std::path::Path::new("/tmp"))
            .await
            .unwrap();
        assert_eq!(selected.index, 0);
        assert_eq!(
            registry.get(stream.id).unwrap().status,
            StreamStatus::Downloading
        );
        acquirer.cleanup(stream.id).await;
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let registry = Arc::new(Registry::new());
        let stream = registry.create("magnet:?xt=urn:btih:abc");
        let fake_torrent = Arc::new(FakeTorrent::new(mp4_files(), SwarmStats::default()));
        let engine = Arc::new(FakeEngine {
            torrent: fake_torrent.clone(),
        });
        let acquirer = Acquirer::new(engine, registry, Duration::from_millis(10));
        acquirer
            .start(stream.id, "magnet:?xt=urn:btih:abc", std::path::Path::new("/tmp"))
            .await
            .unwrap();
        acquirer.cleanup(stream.id).await;
        acquirer.cleanup(stream.id).await;
        assert!(fake_torrent.is_destroyed());
    }

    #[tokio::test]
    async fn watchdog_declares_dead_past_recovery_attempts() {
        let registry = Arc::new(Registry::new());
        let stream = registry.create("magnet:?xt=urn:btih:abc");
        let torrent = Arc::new(FakeTorrent::new(
            mp4_files(),
            SwarmStats {
                downloaded_bytes: 0,
                total_length: 20 * 1024 * 1024,
                connected_peers: 0,
                download_speed_mbps: 0.0,
                upload_speed_mbps: 0.0,
            },
        ));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(watchdog_loop(
            stream.id,
            torrent.clone(),
            registry.clone(),
            cancel.clone(),
            Duration::from_millis(5),
        ));

        // Stalled the whole time and recovers at tick 3 without ever progressing: the
        // recovery attempt must not prevent the dead-torrent condition at tick 6.
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let _ = handle.await;

        assert_eq!(
            registry.get(stream.id).unwrap().status,
            StreamStatus::Error
        );
        assert!(torrent.is_destroyed());
    }
}
