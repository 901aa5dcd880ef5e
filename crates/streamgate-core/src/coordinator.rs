use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::acquirer::Acquirer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packager::{HlsPackager, PackagerMode};
use crate::paths::PathService;
use crate::registry::{Registry, StreamStatus};
use crate::selection::CandidateFile;
use crate::sniff::sniff_container;

const READINESS_POLL: Duration = Duration::from_secs(2);
const FILE_NOT_READY_RETRY_LIMIT: u32 = 3;
const MIN_REQUIRED_BYTES: u64 = 2 * 1024 * 1024;
const MIN_PROCEED_BYTES: u64 = 50 * 1024;
const ONE_MIB: u64 = 1024 * 1024;

struct Orchestration {
    cancel: CancellationToken,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Ties together the path layout, registry, acquirer and packager into the single
/// lazy-initialized, cancellable "stream" entity. Admission is bounded by a semaphore whose
/// permit is held for the entire lifetime of the stream, not just while it downloads.
pub struct StreamCoordinator {
    paths: Arc<PathService>,
    registry: Arc<Registry>,
    acquirer: Arc<Acquirer>,
    packager: Arc<HlsPackager>,
    config: Arc<Config>,
    admission: Arc<Semaphore>,
    orchestrations: Mutex<std::collections::HashMap<Uuid, Arc<Orchestration>>>,
}

impl StreamCoordinator {
    pub fn new(
        paths: Arc<PathService>,
        registry: Arc<Registry>,
        acquirer: Arc<Acquirer>,
        packager: Arc<HlsPackager>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_streams));
        Arc::new(Self {
            paths,
            registry,
            acquirer,
            packager,
            config,
            admission,
            orchestrations: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Creates the registry entry and spawns the orchestration task, returning the stream ID
    /// immediately. Per the "creation never fails asynchronously" policy, this only returns
    /// `Err` for a malformed magnet URI caught before any state is recorded.
    pub async fn create_stream(self: &Arc<Self>, magnet_uri: String) -> Result<Uuid> {
        if !magnet_uri.starts_with("magnet:") || !magnet_uri.contains("xt=urn:btih:") {
            return Err(Error::InvalidInput(
                "magnet URI must start with magnet: and contain xt=urn:btih:".to_string(),
            ));
        }

        let stream = self.registry.create(magnet_uri.clone());
        let cancel = CancellationToken::new();
        let orchestration = Arc::new(Orchestration {
            cancel: cancel.clone(),
            permit: Mutex::new(None),
            handle: Mutex::new(None),
        });
        self.orchestrations
            .lock()
            .insert(stream.id, orchestration.clone());

        let this = self.clone();
        let handle = tokio::spawn(
            this.run(stream.id, magnet_uri, orchestration, cancel)
                .instrument(tracing::info_span!("stream", stream_id = %stream.id)),
        );
        if let Some(o) = self.orchestrations.lock().get(&stream.id) {
            *o.handle.lock() = Some(handle);
        }

        Ok(stream.id)
    }

    async fn run(
        self: Arc<Self>,
        stream_id: Uuid,
        magnet_uri: String,
        orchestration: Arc<Orchestration>,
        cancel: CancellationToken,
    ) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = self.admission.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            warn!(stream_id=%stream_id, "admission semaphore closed, aborting stream");
            return;
        };
        *orchestration.permit.lock() = Some(permit);

        if let Err(e) = self.run_inner(stream_id, &magnet_uri, &cancel).await {
            if matches!(e, Error::Cancelled) {
                info!(stream_id=%stream_id, "stream cancelled during setup");
            } else {
                warn!(stream_id=%stream_id, error=%e, "stream failed");
                self.registry
                    .update_status(stream_id, StreamStatus::Error, Some(e.to_string()));
            }
        }
    }

    async fn run_inner(&self, stream_id: Uuid, magnet_uri: &str, cancel: &CancellationToken) -> Result<()> {
        let (stream_dir, hls_dir) = self.paths.ensure_stream_dirs(stream_id).await?;

        let selected = self.acquirer.start(stream_id, magnet_uri, &stream_dir).await?;

        let mut required_bytes = MIN_REQUIRED_BYTES;
        let deadline_total = self.config.readiness_timeout;
        let mut attempt: u32 = 0;
        let mut mode = PackagerMode::StreamCopy;
        let mut used_reencode_fallback = false;

        loop {
            self.wait_until_ready(stream_id, &selected, &stream_dir, required_bytes, deadline_total, cancel)
                .await?;

            let input_path = resolve_input_path(&stream_dir, &selected)?;
            if attempt == 0 {
                sniff_and_warn(stream_id, &input_path).await;
            }

            match self.packager.convert(stream_id, &input_path, &hls_dir, mode).await {
                Ok(()) => {
                    self.registry.update_status(stream_id, StreamStatus::Ready, None);
                    return Ok(());
                }
                Err(Error::FileNotReady(detail)) => {
                    attempt += 1;
                    if attempt > FILE_NOT_READY_RETRY_LIMIT {
                        return Err(Error::FileNotReady(format!(
                            "exhausted {FILE_NOT_READY_RETRY_LIMIT} retries: {detail}"
                        )));
                    }
                    self.registry
                        .update_status(stream_id, StreamStatus::WaitingForData, None);
                    let delay = if attempt == 1 {
                        Duration::from_secs(10)
                    } else {
                        Duration::from_secs(15)
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    required_bytes *= 2;
                }
                Err(Error::CodecError(detail)) => {
                    if used_reencode_fallback {
                        return Err(Error::PackagerFatal(format!(
                            "re-encode fallback also failed: {detail}"
                        )));
                    }
                    used_reencode_fallback = true;
                    mode = PackagerMode::ReEncode;
                    info!(stream_id=%stream_id, "falling back to re-encode mode");
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Blocks until one of the readiness conditions in the design holds, or fails with
    /// `dead_torrent` once the overall deadline is exceeded with no peers and no speed.
    async fn wait_until_ready(
        &self,
        stream_id: Uuid,
        file: &CandidateFile,
        stream_dir: &Path,
        required_bytes: u64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let candidate_path = stream_dir.join(&file.relative_path);

        loop {
            let disk_size = tokio::fs::metadata(&candidate_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            if disk_size >= file.length {
                return Ok(());
            }

            let file_bytes = self.acquirer.file_downloaded_bytes(stream_id);
            let effective = disk_size.max(file_bytes);
            let threshold = required_bytes.min(file.length / 100).min(ONE_MIB);

            if effective >= threshold {
                return Ok(());
            }

            let elapsed = started.elapsed();
            let swarm = self.acquirer.swarm_stats(stream_id);

            if elapsed >= max_wait / 2 && effective >= MIN_PROCEED_BYTES {
                return Ok(());
            }

            if elapsed >= max_wait {
                if swarm.connected_peers > 0 || swarm.download_speed_mbps > 0.0 {
                    return Ok(());
                }
                return Err(Error::DeadTorrent);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(READINESS_POLL) => {}
            }
        }
    }

    pub fn status(&self, stream_id: Uuid) -> Option<crate::registry::Stream> {
        self.registry.get(stream_id)
    }

    /// Mandatory teardown order: stop the packager (unblocks `convert`'s wait on the child),
    /// destroy the torrent engine, remove the registry entry, delete the on-disk directories.
    /// Idempotent — safe to call more than once or on an unknown stream ID.
    pub async fn cancel_stream(&self, stream_id: Uuid) {
        if let Some(orchestration) = self.orchestrations.lock().remove(&stream_id) {
            orchestration.cancel.cancel();
        }
        self.packager.stop(stream_id).await;
        self.acquirer.cleanup(stream_id).await;
        self.registry.remove(stream_id);
        self.paths.remove_stream_dirs(stream_id).await;
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn paths(&self) -> &PathService {
        &self.paths
    }
}

/// Resolves the actual input path: the torrent engine may place the file at its
/// fully-qualified relative path, or directly in the stream directory; falling back to a
/// recursive scan matching the base filename when neither holds.
fn resolve_input_path(stream_dir: &Path, file: &CandidateFile) -> Result<PathBuf> {
    let direct = stream_dir.join(&file.relative_path);
    if direct.exists() {
        return Ok(direct);
    }

    let basename = file
        .relative_path
        .file_name()
        .ok_or_else(|| Error::NoMedia)?;
    let flat = stream_dir.join(basename);
    if flat.exists() {
        return Ok(flat);
    }

    for entry in WalkDir::new(stream_dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name() == basename {
            return Ok(entry.into_path());
        }
    }

    Err(Error::FileNotReady(format!(
        "input file {basename:?} not found under {stream_dir:?}"
    )))
}

async fn sniff_and_warn(stream_id: Uuid, input_path: &Path) {
    let Ok(mut file) = tokio::fs::File::open(input_path).await else {
        return;
    };
    use tokio::io::AsyncReadExt;
    let mut head = vec![0u8; 1024];
    let Ok(n) = file.read(&mut head).await else {
        return;
    };
    head.truncate(n);
    let container = sniff_container(&head);
    if matches!(container, crate::sniff::Container::Unknown) {
        warn!(stream_id=%stream_id, path=?input_path, "unrecognized container signature, letting ffmpeg decide");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, FakeTorrent};
    use crate::engine::{SwarmStats, TorrentEngine};

    fn make_coordinator(
        tmp: &std::path::Path,
        torrent: Arc<FakeTorrent>,
    ) -> (Arc<StreamCoordinator>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let paths = Arc::new(PathService::new(tmp));
        let engine: Arc<dyn TorrentEngine> = Arc::new(FakeEngine { torrent });
        let acquirer = Arc::new(Acquirer::new(engine, registry.clone(), Duration::from_millis(20)));
        let packager = Arc::new(HlsPackager::new(PathBuf::from("ffmpeg"), registry.clone()));
        let config = Arc::new(Config {
            readiness_timeout: Duration::from_millis(200),
            max_concurrent_streams: 2,
            ..Config::default()
        });
        let coordinator = StreamCoordinator::new(paths, registry.clone(), acquirer, packager, config);
        (coordinator, registry)
    }

    #[tokio::test]
    async fn create_stream_rejects_invalid_magnet_synchronously() {
        let tmp = tempfile::tempdir().unwrap();
        let torrent = Arc::new(FakeTorrent::new(vec![], SwarmStats::default()));
        let (coordinator, _registry) = make_coordinator(tmp.path(), torrent);
        let err = coordinator
            .create_stream("not-a-magnet".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn create_stream_returns_id_immediately_and_starts_downloading() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![CandidateFile {
            index: 0,
            relative_path: "movie.mp4".into(),
            length: 1024,
        }];
        let stats = SwarmStats {
            downloaded_bytes: 1024,
            total_length: 1024,
            connected_peers: 1,
            download_speed_mbps: 1.0,
            upload_speed_mbps: 0.0,
        };
        let torrent = Arc::new(FakeTorrent::new(files, stats));
        let (coordinator, registry) = make_coordinator(tmp.path(), torrent);

        let stream_id = coordinator
            .create_stream("magnet:?xt=urn:btih:abc".to_string())
            .await
            .unwrap();

        let mut status = registry.get(stream_id).unwrap().status;
        for _ in 0..20 {
            if status != StreamStatus::Initializing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = registry.get(stream_id).unwrap().status;
        }
        assert_ne!(status, StreamStatus::Initializing);

        coordinator.cancel_stream(stream_id).await;
        assert!(registry.get(stream_id).is_none());
    }

    #[tokio::test]
    async fn resolve_input_path_falls_back_to_recursive_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("Some.Release.Group");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("movie.mp4"), b"data").await.unwrap();

        let file = CandidateFile {
            index: 0,
            relative_path: "Wrong.Parent/movie.mp4".into(),
            length: 4,
        };
        // Simulate the engine placing the file flat in the stream dir instead of the
        // announced relative path.
        let flat = CandidateFile {
            index: 0,
            relative_path: "different-name.mp4".into(),
            length: 4,
        };
        let resolved = resolve_input_path(tmp.path(), &file).unwrap();
        assert!(resolved.ends_with("movie.mp4"));

        let err = resolve_input_path(tmp.path(), &flat).unwrap_err();
        assert_eq!(err.kind(), "file_not_ready");
    }

    #[tokio::test]
    async fn cancel_stream_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let torrent = Arc::new(FakeTorrent::new(vec![], SwarmStats::default()));
        let (coordinator, _registry) = make_coordinator(tmp.path(), torrent);
        coordinator.cancel_stream(Uuid::new_v4()).await;
        coordinator.cancel_stream(Uuid::new_v4()).await;
    }
}
