use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// The lifecycle states of a stream. `Ready` and `Error` are terminal for forward
/// transitions: subsequent status changes are only ever cleanup (removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Initializing,
    Downloading,
    Converting,
    WaitingForData,
    Ready,
    Error,
}

impl StreamStatus {
    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Downloading | StreamStatus::Converting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamStatus::Ready | StreamStatus::Error)
    }
}

/// The central entity: one per in-flight or completed stream, keyed by its UUID in the
/// registry. Mutated only through `Registry`'s update operations.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: Uuid,
    pub magnet_uri: String,
    pub status: StreamStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub access_count: u64,
    pub last_access: Instant,
    created_instant: Instant,
}

impl Stream {
    fn new(id: Uuid, magnet_uri: String) -> Self {
        let now_instant = Instant::now();
        Self {
            id,
            magnet_uri,
            status: StreamStatus::Initializing,
            progress: 0,
            error: None,
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
            access_count: 0,
            last_access: now_instant,
            created_instant: now_instant,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RegistryStats {
    pub initializing: usize,
    pub downloading: usize,
    pub converting: usize,
    pub waiting_for_data: usize,
    pub ready: usize,
    pub error: usize,
}

/// In-memory mapping from stream ID to `Stream`. The single cross-task mutable structure in
/// the system: all access is serialised by one mutex, which is fine because the map stays
/// small (tens of entries in practice) and every update is cheap.
#[derive(Default)]
pub struct Registry {
    streams: Mutex<HashMap<Uuid, Stream>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, magnet_uri: impl Into<String>) -> Stream {
        let id = Uuid::new_v4();
        let stream = Stream::new(id, magnet_uri.into());
        self.streams.lock().insert(id, stream.clone());
        stream
    }

    pub fn get(&self, id: Uuid) -> Option<Stream> {
        self.streams.lock().get(&id).cloned()
    }

    /// Moves a stream to `new_status`, recording `error` if given. Once a stream has
    /// reached `Error` it never transitions forward again — only cleanup (`remove`) follows.
    pub fn update_status(&self, id: Uuid, new_status: StreamStatus, error: Option<String>) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(&id) {
            if stream.status == StreamStatus::Error {
                return;
            }
            stream.status = new_status;
            if new_status == StreamStatus::Ready {
                stream.progress = 100;
            }
            if error.is_some() {
                stream.error = error;
            }
            stream.updated_at = SystemTime::now();
        }
    }

    /// Clamps to `[0, 100]`. Once `Ready`, progress is pinned at 100 regardless of what is
    /// reported afterwards, per the stream invariant.
    pub fn update_progress(&self, id: Uuid, progress: u8) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(&id) {
            if stream.status == StreamStatus::Ready {
                return;
            }
            stream.progress = progress.min(100);
            stream.updated_at = SystemTime::now();
        }
    }

    pub fn keep_alive(&self, id: Uuid) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(&id) {
            stream.access_count += 1;
            stream.last_access = Instant::now();
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<Stream> {
        self.streams.lock().remove(&id)
    }

    pub fn list_by_status(&self, status: StreamStatus) -> Vec<Stream> {
        self.streams
            .lock()
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    /// Streams older than `max_age`, excluding any currently `Downloading` or `Converting`
    /// so a slow-but-healthy stream is never swept out from under the janitor.
    pub fn list_older_than(&self, max_age: Duration) -> Vec<Stream> {
        self.streams
            .lock()
            .values()
            .filter(|s| !s.status.is_active() && s.age() >= max_age)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for stream in self.streams.lock().values() {
            match stream.status {
                StreamStatus::Initializing => stats.initializing += 1,
                StreamStatus::Downloading => stats.downloading += 1,
                StreamStatus::Converting => stats.converting += 1,
                StreamStatus::WaitingForData => stats.waiting_for_data += 1,
                StreamStatus::Ready => stats.ready += 1,
                StreamStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_initializing_with_zero_progress() {
        let reg = Registry::new();
        let stream = reg.create("magnet:?xt=urn:btih:deadbeef");
        assert_eq!(stream.status, StreamStatus::Initializing);
        assert_eq!(stream.progress, 0);
    }

    #[test]
    fn progress_is_clamped_and_pinned_at_ready() {
        let reg = Registry::new();
        let stream = reg.create("magnet:?xt=urn:btih:deadbeef");
        reg.update_progress(stream.id, 250);
        assert_eq!(reg.get(stream.id).unwrap().progress, 100);

        reg.update_status(stream.id, StreamStatus::Ready, None);
        reg.update_progress(stream.id, 5);
        assert_eq!(reg.get(stream.id).unwrap().progress, 100);
    }

    #[test]
    fn error_is_terminal_for_forward_transitions() {
        let reg = Registry::new();
        let stream = reg.create("magnet:?xt=urn:btih:deadbeef");
        reg.update_status(stream.id, StreamStatus::Error, Some("dead".into()));
        reg.update_status(stream.id, StreamStatus::Downloading, None);
        assert_eq!(reg.get(stream.id).unwrap().status, StreamStatus::Error);
    }

    #[test]
    fn list_older_than_excludes_active_streams() {
        let reg = Registry::new();
        let downloading = reg.create("magnet:?xt=urn:btih:1");
        reg.update_status(downloading.id, StreamStatus::Downloading, None);

        let idle = reg.create("magnet:?xt=urn:btih:2");
        reg.update_status(idle.id, StreamStatus::Ready, None);

        let old = reg.list_older_than(Duration::from_secs(0));
        let ids: Vec<_> = old.iter().map(|s| s.id).collect();
        assert!(ids.contains(&idle.id));
        assert!(!ids.contains(&downloading.id));
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = Registry::new();
        let stream = reg.create("magnet:?xt=urn:btih:1");
        assert!(reg.remove(stream.id).is_some());
        assert!(reg.remove(stream.id).is_none());
    }

    #[test]
    fn stats_counts_per_status() {
        let reg = Registry::new();
        let a = reg.create("magnet:?xt=urn:btih:1");
        reg.update_status(a.id, StreamStatus::Ready, None);
        let _b = reg.create("magnet:?xt=urn:btih:2");
        let stats = reg.stats();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.initializing, 1);
    }
}
