use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Computes and creates the per-stream directory layout and proves write-ability before
/// handing paths back to the acquirer and packager. Stateless apart from the configured
/// root, so it has no internal locking and can be constructed cheaply per call site.
#[derive(Debug, Clone)]
pub struct PathService {
    root: PathBuf,
}

impl PathService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First 8 hex digits of the MD5 of the stream ID: short, filesystem-safe, and
    /// collision-resistant within a running process. The registry key remains the full UUID.
    pub fn hash_id(id: Uuid) -> String {
        let mut hasher = Md5::new();
        hasher.update(id.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    pub fn stream_dir(&self, id: Uuid) -> PathBuf {
        self.root.join("streams").join(Self::hash_id(id))
    }

    pub fn hls_dir(&self, id: Uuid) -> PathBuf {
        self.root.join("hls").join(Self::hash_id(id))
    }

    pub fn playlist_path(&self, id: Uuid) -> PathBuf {
        self.hls_dir(id).join("playlist.m3u8")
    }

    pub fn segment_path(&self, id: Uuid, name: &str) -> PathBuf {
        self.hls_dir(id).join(name)
    }

    /// Creates `dir` (and ancestors, mode `0o755`) and proves write-ability with a
    /// probe-file create/delete. Silent failures here would otherwise surface much later as
    /// opaque packager errors, so this fails loudly with a distinct error kind.
    pub async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| Error::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            let _ = tokio::fs::set_permissions(dir, perms).await;
        }

        let probe = dir.join(".streamgate-write-probe");
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|source| Error::Io {
                path: probe.clone(),
                source,
            })?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|source| Error::Io {
                path: probe,
                source,
            })?;
        Ok(())
    }

    /// Creates both sibling directories for a stream and proves write-ability in each.
    pub async fn ensure_stream_dirs(&self, id: Uuid) -> Result<(PathBuf, PathBuf)> {
        let stream_dir = self.stream_dir(id);
        let hls_dir = self.hls_dir(id);
        self.ensure_dir(&stream_dir).await?;
        self.ensure_dir(&hls_dir).await?;
        Ok((stream_dir, hls_dir))
    }

    /// Best-effort removal of both directories. Never errors: cleanup must be safe to call
    /// even if the directories were never created or already removed.
    pub async fn remove_stream_dirs(&self, id: Uuid) {
        let _ = tokio::fs::remove_dir_all(self.stream_dir(id)).await;
        let _ = tokio::fs::remove_dir_all(self.hls_dir(id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_id_is_stable_and_short() {
        let id = Uuid::nil();
        let h1 = PathService::hash_id(id);
        let h2 = PathService::hash_id(id);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);
    }

    #[test]
    fn different_ids_hash_differently() {
        let a = PathService::hash_id(Uuid::from_u128(1));
        let b = PathService::hash_id(Uuid::from_u128(2));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn ensure_dir_creates_and_is_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = PathService::new(tmp.path());
        let id = Uuid::new_v4();
        let (stream_dir, hls_dir) = svc.ensure_stream_dirs(id).await.unwrap();
        assert!(stream_dir.is_dir());
        assert!(hls_dir.is_dir());
    }

    #[tokio::test]
    async fn remove_stream_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = PathService::new(tmp.path());
        let id = Uuid::new_v4();
        svc.ensure_stream_dirs(id).await.unwrap();
        svc.remove_stream_dirs(id).await;
        svc.remove_stream_dirs(id).await;
        assert!(!svc.stream_dir(id).exists());
        assert!(!svc.hls_dir(id).exists());
    }
}
