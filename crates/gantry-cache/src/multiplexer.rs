//! Backend dispatch and the local-first multi-tier cache

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::fs::FsCache;
use crate::noop::NoopCache;
use crate::remote::RemoteCache;
use crate::{Cache, ItemStatus};

/// Local tier first, remote second, with write-back of remote hits
#[derive(Clone)]
pub struct CacheMultiplexer {
    fs: FsCache,
    remote: RemoteCache,
}

impl CacheMultiplexer {
    pub fn new(fs: FsCache, remote: RemoteCache) -> Self {
        Self { fs, remote }
    }

    pub fn fs(&self) -> &FsCache {
        &self.fs
    }
}

#[async_trait]
impl Cache for CacheMultiplexer {
    async fn put(&self, anchor: &Path, hash: &str, duration_ms: u64, files: &[PathBuf]) -> Result<()> {
        self.fs.put(anchor, hash, duration_ms, files).await?;
        self.remote.put(anchor, hash, duration_ms, files).await
    }

    async fn fetch(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        let (status, files) = self.fs.fetch(anchor, hash).await?;
        if status.hit {
            return Ok((status, files));
        }

        let (status, files) = self.remote.fetch(anchor, hash).await?;
        if status.hit {
            // the restored files are now on disk, so archive them locally
            match self.fs.put(anchor, hash, status.time_saved, &files).await {
                Ok(()) => debug!(hash, "Wrote remote hit back to local cache"),
                Err(e) => warn!(hash, error = %e, "Failed to write remote hit to local cache"),
            }
        }
        Ok((status, files))
    }

    async fn exists(&self, hash: &str) -> Result<ItemStatus> {
        let status = self.fs.exists(hash).await?;
        if status.hit {
            return Ok(status);
        }
        self.remote.exists(hash).await
    }

    async fn clean(&self, dir: &Path) -> Result<()> {
        self.fs.clean(dir).await?;
        self.remote.clean(dir).await
    }

    async fn clean_all(&self) -> Result<()> {
        self.fs.clean_all().await?;
        self.remote.clean_all().await
    }

    async fn shutdown(&self) {
        self.fs.shutdown().await;
        self.remote.shutdown().await;
    }
}

/// Every cache configuration a run can use
#[derive(Clone)]
pub enum CacheBackend {
    Noop(NoopCache),
    Fs(FsCache),
    Remote(RemoteCache),
    Multiplexed(CacheMultiplexer),
}

impl CacheBackend {
    fn inner(&self) -> &dyn Cache {
        match self {
            Self::Noop(cache) => cache,
            Self::Fs(cache) => cache,
            Self::Remote(cache) => cache,
            Self::Multiplexed(cache) => cache,
        }
    }

    /// The local tier, if this backend has one
    pub fn local(&self) -> Option<&FsCache> {
        match self {
            Self::Fs(cache) => Some(cache),
            Self::Multiplexed(cache) => Some(cache.fs()),
            Self::Noop(_) | Self::Remote(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Noop(_) => "disabled",
            Self::Fs(_) => "local",
            Self::Remote(_) => "remote",
            Self::Multiplexed(_) => "local+remote",
        }
    }
}

#[async_trait]
impl Cache for CacheBackend {
    async fn put(&self, anchor: &Path, hash: &str, duration_ms: u64, files: &[PathBuf]) -> Result<()> {
        self.inner().put(anchor, hash, duration_ms, files).await
    }

    async fn fetch(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        self.inner().fetch(anchor, hash).await
    }

    async fn exists(&self, hash: &str) -> Result<ItemStatus> {
        self.inner().exists(hash).await
    }

    async fn clean(&self, dir: &Path) -> Result<()> {
        self.inner().clean(dir).await
    }

    async fn clean_all(&self) -> Result<()> {
        self.inner().clean_all().await
    }

    async fn shutdown(&self) {
        self.inner().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::analytics::{CacheEventKind, MemoryRecorder};
    use crate::error::CacheError;
    use crate::remote::testing::MemoryArtifactClient;
    use crate::CacheSource;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        anchor: PathBuf,
        cache: CacheMultiplexer,
        client: Arc<MemoryArtifactClient>,
        recorder: MemoryRecorder,
    }

    fn fixture(client: MemoryArtifactClient) -> Fixture {
        let temp = TempDir::new().unwrap();
        let anchor = temp.path().join("repo");
        fs::create_dir_all(anchor.join("dist")).unwrap();
        fs::write(anchor.join("dist/app.js"), b"app").unwrap();

        let recorder = MemoryRecorder::default();
        let client = Arc::new(client);
        let fs_cache =
            FsCache::new(temp.path().join("cache"), Arc::new(recorder.clone())).unwrap();
        let remote = RemoteCache::new(client.clone(), Arc::new(recorder.clone()));
        Fixture {
            _temp: temp,
            anchor,
            cache: CacheMultiplexer::new(fs_cache, remote),
            client,
            recorder,
        }
    }

    fn outputs() -> Vec<PathBuf> {
        vec![PathBuf::from("dist"), PathBuf::from("dist/app.js")]
    }

    #[tokio::test]
    async fn test_put_writes_both_tiers() {
        let f = fixture(MemoryArtifactClient::default());
        f.cache.put(&f.anchor, "m1", 40, &outputs()).await.unwrap();

        assert!(f.cache.fs().exists("m1").await.unwrap().hit);
        assert!(f.client.artifacts.lock().unwrap().contains_key("m1"));
    }

    #[tokio::test]
    async fn test_local_hit_skips_remote() {
        let f = fixture(MemoryArtifactClient::default());
        f.cache.put(&f.anchor, "m2", 40, &outputs()).await.unwrap();

        let (status, _) = f.cache.fetch(&f.anchor, "m2").await.unwrap();
        assert_eq!(status.source, Some(CacheSource::Fs));
        let sources: Vec<_> = f.recorder.events().iter().map(|e| e.source).collect();
        assert_eq!(sources, vec![CacheSource::Fs]);
    }

    #[tokio::test]
    async fn test_remote_hit_is_written_back() {
        let f = fixture(MemoryArtifactClient::default());
        f.cache
            .remote
            .put(&f.anchor, "m3", 60, &outputs())
            .await
            .unwrap();
        fs::remove_dir_all(f.anchor.join("dist")).unwrap();

        let (status, files) = f.cache.fetch(&f.anchor, "m3").await.unwrap();
        assert_eq!(status, ItemStatus::hit(CacheSource::Remote, 60));
        assert_eq!(files, outputs());
        assert_eq!(fs::read(f.anchor.join("dist/app.js")).unwrap(), b"app");

        let local = f.cache.fs().exists("m3").await.unwrap();
        assert_eq!(local, ItemStatus::hit(CacheSource::Fs, 60));

        let events: Vec<_> = f
            .recorder
            .events()
            .into_iter()
            .map(|e| (e.source, e.event))
            .collect();
        assert_eq!(
            events,
            vec![
                (CacheSource::Fs, CacheEventKind::Miss),
                (CacheSource::Remote, CacheEventKind::Hit),
            ]
        );
    }

    #[tokio::test]
    async fn test_corrupt_local_item_does_not_fall_through() {
        let f = fixture(MemoryArtifactClient::default());
        f.cache
            .remote
            .put(&f.anchor, "m4", 1, &outputs())
            .await
            .unwrap();
        fs::write(f.cache.fs().cache_dir().join("m4.tar.zst"), b"junk").unwrap();

        let err = f.cache.fetch(&f.anchor, "m4").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Corrupt {
                tier: CacheSource::Fs,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_offline_remote_still_caches_locally() {
        let f = fixture(MemoryArtifactClient::offline());
        f.cache.put(&f.anchor, "m5", 5, &outputs()).await.unwrap();
        assert!(f.cache.exists("m5").await.unwrap().hit);
        assert!(!f.cache.exists("missing").await.unwrap().hit);
    }

    #[tokio::test]
    async fn test_backend_dispatch() {
        let f = fixture(MemoryArtifactClient::default());
        let backend = CacheBackend::Multiplexed(f.cache.clone());
        assert_eq!(backend.kind(), "local+remote");
        assert!(backend.local().is_some());

        backend.put(&f.anchor, "m6", 3, &outputs()).await.unwrap();
        assert!(backend.exists("m6").await.unwrap().hit);

        backend.clean_all().await.unwrap();
        assert!(!f.cache.fs().exists("m6").await.unwrap().hit);
        // remote items survive clean_all
        assert!(backend.exists("m6").await.unwrap().hit);

        let noop = CacheBackend::Noop(NoopCache);
        assert!(noop.local().is_none());
        assert!(!noop.exists("m6").await.unwrap().hit);
    }
}
