use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::selection::CandidateFile;

/// Point-in-time swarm statistics, the three readiness signals in descending priority order
/// (on-disk size is read separately by the caller; this covers the engine-reported ones).
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmStats {
    pub downloaded_bytes: u64,
    pub total_length: u64,
    pub connected_peers: u32,
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
}

/// The capability interface the rest of the core depends on instead of a concrete engine
/// type. A running torrent: files, selection, per-file progress, and teardown. Keeping this
/// narrow is what lets the watchdog, the selection policy and the coordinator run against a
/// fake in tests without a real swarm.
#[async_trait]
pub trait RunningTorrent: Send + Sync {
    fn files(&self) -> Vec<CandidateFile>;

    /// Selects the file for download and raises it to the highest priority if supported.
    fn select_file(&self, index: usize) -> anyhow::Result<()>;

    /// Best-effort: some engines don't implement deselection. Failures are logged and
    /// tolerated by the caller, never propagated as a stream failure.
    fn deselect_file(&self, index: usize) -> anyhow::Result<()>;

    fn stats(&self) -> SwarmStats;

    fn file_downloaded_bytes(&self, index: usize) -> u64;

    /// Swarm pause/resume used by the watchdog's stall-recovery attempt.
    async fn pause(&self) -> anyhow::Result<()>;
    async fn resume(&self) -> anyhow::Result<()>;

    /// Idempotent teardown.
    async fn destroy(&self) -> anyhow::Result<()>;
}

/// Wraps a BitTorrent engine: starts it against a magnet URI and hands back a handle that
/// implements `RunningTorrent`. Kept separate from `RunningTorrent` so the engine itself
/// (connection limits, DHT, trackers) is configured once and reused across streams.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    async fn start(
        &self,
        magnet_uri: &str,
        output_dir: &Path,
    ) -> anyhow::Result<Arc<dyn RunningTorrent>>;
}

/// Engine configuration: peer limits, ports and trackers, per the acquirer's engine
/// configuration section. Deterministic ports make NAT traversal and firewall rules
/// reproducible across restarts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub peer_connection_limit: usize,
    pub bittorrent_port: u16,
    pub dht_port: u16,
    pub enable_dht: bool,
    pub enable_trackers: bool,
    pub fallback_trackers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_connection_limit: 100,
            bittorrent_port: 6881,
            dht_port: 6882,
            enable_dht: true,
            enable_trackers: true,
            fallback_trackers: default_fallback_trackers(),
        }
    }
}

/// UDP trackers first (cheaper handshake), HTTP as backup.
fn default_fallback_trackers() -> Vec<String> {
    vec![
        "udp://tracker.opentrackr.org:1337/announce".to_string(),
        "udp://tracker.openbittorrent.com:6969/announce".to_string(),
        "udp://open.stealth.si:80/announce".to_string(),
        "http://tracker.opentrackr.org:1337/announce".to_string(),
    ]
}

/// DHT bootstrap nodes injected when peer discovery stalls at startup.
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Adapts the `librqbit` session/torrent API to the `TorrentEngine`/`RunningTorrent`
/// capability interface. Deliberately built only against the internally consistent cluster
/// of `librqbit` types (`Session`, `ManagedTorrent`, `TorrentStats`, the `live` peer
/// snapshot) rather than every call pattern seen across the library's modules.
pub struct LibrqbitEngine {
    session: Arc<librqbit::Session>,
    config: EngineConfig,
}

impl LibrqbitEngine {
    pub async fn new(output_root: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let mut opts = librqbit::SessionOptions::default();
        opts.disable_dht = !config.enable_dht;
        opts.listen_port_range = Some(config.bittorrent_port..config.bittorrent_port + 1);
        opts.peer_opts = Some(librqbit::PeerConnectionOptions {
            connect_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        if config.enable_dht {
            opts.dht_config = Some(librqbit::dht::PersistentDhtConfig {
                port: Some(config.dht_port),
                bootstrap_addrs: Some(DHT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            });
        }
        let session = librqbit::Session::new_with_opts(output_root, opts).await?;
        Ok(Self { session, config })
    }
}

/// Appends `tr=` parameters for each fallback tracker to the magnet URI, the same mechanism
/// by which `librqbit_core::magnet::Magnet::parse` reads trackers off any magnet link.
fn augment_magnet_with_fallback_trackers(magnet_uri: &str, fallback_trackers: &[String]) -> String {
    if fallback_trackers.is_empty() {
        return magnet_uri.to_string();
    }
    let mut augmented = magnet_uri.to_string();
    for tracker in fallback_trackers {
        augmented.push_str("&tr=");
        augmented.push_str(&urlencoding::encode(tracker));
    }
    augmented
}

#[async_trait]
impl TorrentEngine for LibrqbitEngine {
    async fn start(
        &self,
        magnet_uri: &str,
        output_dir: &Path,
    ) -> anyhow::Result<Arc<dyn RunningTorrent>> {
        let magnet = if self.config.enable_trackers {
            augment_magnet_with_fallback_trackers(magnet_uri, &self.config.fallback_trackers)
        } else {
            magnet_uri.to_string()
        };
        let explicit_peers = parse_explicit_peers(magnet_uri);
        if !explicit_peers.is_empty() {
            debug!(count = explicit_peers.len(), "injecting explicit peer hints from magnet");
        }

        let add = librqbit::AddTorrent::from_url(&magnet);
        let opts = librqbit::AddTorrentOptions {
            output_folder: Some(output_dir.to_string_lossy().into_owned()),
            overwrite: true,
            disable_trackers: !self.config.enable_trackers,
            initial_peers: (!explicit_peers.is_empty()).then_some(explicit_peers),
            ..Default::default()
        };
        let response = self.session.add_torrent(add, Some(opts)).await?;
        let handle = response
            .into_handle()
            .ok_or_else(|| anyhow::anyhow!("magnet resolved to list-only response"))?;
        handle.wait_until_initialized().await?;
        Ok(Arc::new(LibrqbitTorrent {
            session: self.session.clone(),
            handle,
        }))
    }
}

struct LibrqbitTorrent {
    session: Arc<librqbit::Session>,
    handle: librqbit::ManagedTorrentHandle,
}

impl LibrqbitTorrent {
    fn selected_files(&self) -> HashSet<usize> {
        self.handle
            .only_files()
            .map(|v| v.into_iter().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunningTorrent for LibrqbitTorrent {
    fn files(&self) -> Vec<CandidateFile> {
        self.handle
            .with_metadata(|metadata| {
                metadata
                    .file_infos
                    .iter()
                    .enumerate()
                    .map(|(index, fi)| CandidateFile {
                        index,
                        relative_path: fi.relative_filename.clone(),
                        length: fi.len,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn select_file(&self, index: usize) -> anyhow::Result<()> {
        let mut only_files = self.selected_files();
        only_files.insert(index);
        self.session.update_only_files(&self.handle, &only_files)
    }

    fn deselect_file(&self, index: usize) -> anyhow::Result<()> {
        let mut only_files = self.selected_files();
        only_files.remove(&index);
        self.session.update_only_files(&self.handle, &only_files)
    }

    fn stats(&self) -> SwarmStats {
        let stats = self.handle.stats();
        let live = stats.live.as_ref();
        SwarmStats {
            downloaded_bytes: stats.progress_bytes,
            total_length: stats.total_bytes,
            connected_peers: live
                .map(|l| l.snapshot.peer_stats.live)
                .unwrap_or(0),
            download_speed_mbps: live.map(|l| l.download_speed.mbps).unwrap_or(0.0),
            upload_speed_mbps: live.map(|l| l.upload_speed.mbps).unwrap_or(0.0),
        }
    }

    fn file_downloaded_bytes(&self, _index: usize) -> u64 {
        self.handle.stats().progress_bytes
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.session
            .update_only_files(&self.handle, &HashSet::new())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        let only_files = self.selected_files();
        self.session.update_only_files(&self.handle, &only_files)?;
        self.session.unpause(&self.handle)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.session.delete(self.handle.id(), false)
    }
}

/// Injects any `x.pe=` peer hints embedded in the magnet URI directly into the swarm.
/// Best-effort: callers log and ignore failures, per the peer-discovery-recovery design.
pub fn parse_explicit_peers(magnet_uri: &str) -> Vec<SocketAddr> {
    let mut peers = Vec::new();
    if let Ok(url) = url::Url::parse(magnet_uri) {
        for (key, value) in url.query_pairs() {
            if key == "x.pe" {
                if let Ok(addr) = value.parse::<SocketAddr>() {
                    peers.push(addr);
                }
            }
        }
    }
    peers
}

/// Deterministic test doubles, also exposed to other workspace crates under `test-util` so
/// the HTTP layer's integration tests can build a `StreamCoordinator` without a real swarm.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Deterministic double used to exercise the acquirer/coordinator state machine without
    /// a real swarm or FFmpeg process.
    pub struct FakeTorrent {
        pub files: Vec<CandidateFile>,
        pub stats: Mutex<SwarmStats>,
        pub selected: Mutex<HashSet<usize>>,
        pub destroyed: Mutex<bool>,
        pub paused: Mutex<bool>,
    }

    impl FakeTorrent {
        pub fn new(files: Vec<CandidateFile>, stats: SwarmStats) -> Self {
            Self {
                files,
                stats: Mutex::new(stats),
                selected: Mutex::new(HashSet::new()),
                destroyed: Mutex::new(false),
                paused: Mutex::new(false),
            }
        }

        pub fn set_stats(&self, stats: SwarmStats) {
            *self.stats.lock() = stats;
        }

        pub fn is_destroyed(&self) -> bool {
            *self.destroyed.lock()
        }
    }

    #[async_trait]
    impl RunningTorrent for FakeTorrent {
        fn files(&self) -> Vec<CandidateFile> {
            self.files.clone()
        }

        fn select_file(&self, index: usize) -> anyhow::Result<()> {
            self.selected.lock().insert(index);
            Ok(())
        }

        fn deselect_file(&self, index: usize) -> anyhow::Result<()> {
            self.selected.lock().remove(&index);
            Ok(())
        }

        fn stats(&self) -> SwarmStats {
            *self.stats.lock()
        }

        fn file_downloaded_bytes(&self, _index: usize) -> u64 {
            self.stats.lock().downloaded_bytes
        }

        async fn pause(&self) -> anyhow::Result<()> {
            *self.paused.lock() = true;
            Ok(())
        }

        async fn resume(&self) -> anyhow::Result<()> {
            *self.paused.lock() = false;
            Ok(())
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            *self.destroyed.lock() = true;
            Ok(())
        }
    }

    pub struct FakeEngine {
        pub torrent: Arc<FakeTorrent>,
    }

    #[async_trait]
    impl TorrentEngine for FakeEngine {
        async fn start(
            &self,
            _magnet_uri: &str,
            _output_dir: &Path,
        ) -> anyhow::Result<Arc<dyn RunningTorrent>> {
            Ok(self.torrent.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_peers_are_parsed_from_magnet() {
        let magnet = "magnet:?xt=urn:btih:abc&x.pe=127.0.0.1:6881";
        let peers = parse_explicit_peers(magnet);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 6881);
    }

    #[test]
    fn malformed_magnet_yields_no_peers() {
        assert!(parse_explicit_peers("not a url").is_empty());
    }
}
