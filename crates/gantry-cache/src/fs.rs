//! Local filesystem cache tier
//!
//! Layout: `<dir>/<hash>.tar.zst` (or `<hash>.tar`) plus `<dir>/<hash>-meta.json`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::analytics::{CacheEvent, Recorder};
use crate::cacheitem::{CacheReader, CacheWriter};
use crate::error::{CacheError, Result};
use crate::metadata::CacheMetadata;
use crate::{Cache, CacheSource, ItemStatus};

const META_SUFFIX: &str = "-meta.json";
const TEMP_PREFIX: &str = ".tmp";

/// Archives stored in a local directory
#[derive(Clone)]
pub struct FsCache {
    cache_dir: PathBuf,
    compress: bool,
    recorder: Arc<dyn Recorder>,
}

impl std::fmt::Debug for FsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCache")
            .field("cache_dir", &self.cache_dir)
            .field("compress", &self.compress)
            .finish()
    }
}

impl FsCache {
    /// Open (creating if needed) a cache rooted at `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>, recorder: Arc<dyn Recorder>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            compress: true,
            recorder,
        })
    }

    /// Write plain `.tar` archives instead of `.tar.zst`
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn archive_path(&self, hash: &str, compressed: bool) -> PathBuf {
        let ext = if compressed { "tar.zst" } else { "tar" };
        self.cache_dir.join(format!("{}.{}", hash, ext))
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", hash, META_SUFFIX))
    }

    /// Locate an existing archive, preferring the uncompressed form
    fn find_archive(&self, hash: &str) -> Option<PathBuf> {
        [false, true]
            .into_iter()
            .map(|compressed| self.archive_path(hash, compressed))
            .find(|p| p.is_file())
    }

    fn saved_duration(&self, hash: &str) -> u64 {
        let path = self.meta_path(hash);
        match CacheMetadata::read(&path) {
            Ok(meta) => meta.duration,
            Err(e) => {
                warn!(hash, error = %e, "Cache item has no readable metadata, assuming no time saved");
                0
            }
        }
    }

    fn put_blocking(&self, anchor: &Path, hash: &str, duration: u64, files: &[PathBuf]) -> Result<()> {
        check_hash(hash)?;
        let destination = self.archive_path(hash, self.compress);
        let mut writer = CacheWriter::create(&destination)?;
        for file in files {
            writer.add_file(anchor, file)?;
        }
        writer.close()?;

        // a stale archive of the other format would shadow this one on fetch
        let other = self.archive_path(hash, !self.compress);
        if other.exists() {
            fs::remove_file(&other)?;
        }

        CacheMetadata::new(hash, duration).write(&self.meta_path(hash))?;
        debug!(hash, files = files.len(), "Stored cache item");
        Ok(())
    }

    fn fetch_blocking(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        check_hash(hash)?;
        let Some(archive) = self.find_archive(hash) else {
            self.recorder.record(CacheEvent::miss(CacheSource::Fs, hash));
            return Ok((ItemStatus::miss(), Vec::new()));
        };

        let restored = CacheReader::open(&archive)
            .and_then(|reader| reader.restore(anchor))
            .map_err(|e| CacheError::corrupt(hash, CacheSource::Fs, e))?;

        let duration = self.saved_duration(hash);
        self.recorder
            .record(CacheEvent::hit(CacheSource::Fs, hash, duration));
        Ok((ItemStatus::hit(CacheSource::Fs, duration), restored))
    }

    fn exists_blocking(&self, hash: &str) -> Result<ItemStatus> {
        check_hash(hash)?;
        if self.find_archive(hash).is_none() {
            return Ok(ItemStatus::miss());
        }
        Ok(ItemStatus::hit(CacheSource::Fs, self.saved_duration(hash)))
    }

    /// Remove interrupted-write temporaries and metadata without an archive
    fn clean_blocking(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.cache_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let orphaned_meta = name
                .strip_suffix(META_SUFFIX)
                .is_some_and(|hash| self.find_archive(hash).is_none());
            if name.starts_with(TEMP_PREFIX) || orphaned_meta {
                remove_path(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clean_all_blocking(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.cache_dir)? {
            remove_path(&entry?.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove cache items whose archive is older than `max_age`
    #[instrument(skip(self), fields(dir = %self.cache_dir.display()))]
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats> {
        info!(max_age_secs = max_age.as_secs(), "Pruning cache");
        let mut stats = PruneStats::default();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());

        for entry in read_dir_or_empty(&self.cache_dir)? {
            let path = entry?.path();
            let Some(hash) = archive_hash(&path) else {
                continue;
            };
            stats.total += 1;

            let modified: chrono::DateTime<chrono::Utc> = fs::metadata(&path)?.modified()?.into();
            if modified < cutoff {
                fs::remove_file(&path)?;
                let meta = self.meta_path(hash);
                if meta.exists() {
                    fs::remove_file(meta)?;
                }
                stats.removed += 1;
            } else {
                stats.kept += 1;
            }
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "Cache prune complete");
        Ok(stats)
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for entry in read_dir_or_empty(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if archive_hash(&path).is_some() {
                stats.entries += 1;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.total_size += meta.len();
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl Cache for FsCache {
    #[instrument(skip(self, files), fields(files = files.len()))]
    async fn put(&self, anchor: &Path, hash: &str, duration_ms: u64, files: &[PathBuf]) -> Result<()> {
        let cache = self.clone();
        let anchor = anchor.to_path_buf();
        let hash = hash.to_string();
        let files = files.to_vec();
        blocking(move || cache.put_blocking(&anchor, &hash, duration_ms, &files)).await
    }

    #[instrument(skip(self))]
    async fn fetch(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        let cache = self.clone();
        let anchor = anchor.to_path_buf();
        let hash = hash.to_string();
        blocking(move || cache.fetch_blocking(&anchor, &hash)).await
    }

    async fn exists(&self, hash: &str) -> Result<ItemStatus> {
        self.exists_blocking(hash)
    }

    async fn clean(&self, _dir: &Path) -> Result<()> {
        let removed = self.clean_blocking()?;
        debug!(removed, "Cleaned cache leftovers");
        Ok(())
    }

    async fn clean_all(&self) -> Result<()> {
        let removed = self.clean_all_blocking()?;
        info!(removed, dir = %self.cache_dir.display(), "Cleared local cache");
        Ok(())
    }

    async fn shutdown(&self) {}
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
}

/// Hashes are used as file names, so they must be a single plain segment
fn check_hash(hash: &str) -> Result<()> {
    let valid = !hash.is_empty()
        && !hash.starts_with('.')
        && !hash.contains(['/', '\\'])
        && !hash.contains("..");
    if valid {
        Ok(())
    } else {
        Err(CacheError::MalformedName(hash.to_string()))
    }
}

/// The hash of an archive file, if `path` is one
fn archive_hash(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with(TEMP_PREFIX) {
        return None;
    }
    name.strip_suffix(".tar.zst")
        .or_else(|| name.strip_suffix(".tar"))
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Box<dyn Iterator<Item = io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(e) => Err(e),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total cache items found
    pub total: usize,
    /// Items removed
    pub removed: usize,
    /// Items kept
    pub kept: usize,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache items
    pub entries: usize,
    /// Total size in bytes, metadata included
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        const KB: f64 = 1024.0;
        let size = self.total_size as f64;
        if size < KB {
            format!("{} B", self.total_size)
        } else if size < KB * KB {
            format!("{:.1} KB", size / KB)
        } else if size < KB * KB * KB {
            format!("{:.1} MB", size / (KB * KB))
        } else {
            format!("{:.1} GB", size / (KB * KB * KB))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{CacheEventKind, MemoryRecorder};
    use tempfile::TempDir;

    fn setup() -> (TempDir, FsCache, MemoryRecorder) {
        let temp = TempDir::new().unwrap();
        let recorder = MemoryRecorder::default();
        let cache = FsCache::new(temp.path().join("cache"), Arc::new(recorder.clone())).unwrap();
        (temp, cache, recorder)
    }

    fn write_outputs(anchor: &Path) -> Vec<PathBuf> {
        fs::create_dir_all(anchor.join("dist")).unwrap();
        fs::write(anchor.join("dist/out.js"), b"built").unwrap();
        vec![PathBuf::from("dist"), PathBuf::from("dist/out.js")]
    }

    #[tokio::test]
    async fn test_exists_after_put() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);

        assert!(!cache.exists("abc123").await.unwrap().hit);
        cache.put(&anchor, "abc123", 2500, &files).await.unwrap();

        let status = cache.exists("abc123").await.unwrap();
        assert_eq!(status, ItemStatus::hit(CacheSource::Fs, 2500));
        assert!(cache.cache_dir().join("abc123.tar.zst").exists());
        assert!(cache.cache_dir().join("abc123-meta.json").exists());
    }

    #[tokio::test]
    async fn test_fetch_restores_files() {
        let (temp, cache, recorder) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "h1", 100, &files).await.unwrap();

        let restore_to = temp.path().join("restore");
        fs::create_dir_all(&restore_to).unwrap();
        let (status, restored) = cache.fetch(&restore_to, "h1").await.unwrap();

        assert!(status.hit);
        assert_eq!(status.time_saved, 100);
        assert_eq!(restored, files);
        assert_eq!(fs::read(restore_to.join("dist/out.js")).unwrap(), b"built");

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, CacheEventKind::Hit);
        assert_eq!(events[0].duration, 100);
    }

    #[tokio::test]
    async fn test_miss_writes_nothing() {
        let (temp, cache, recorder) = setup();
        let anchor = temp.path().join("empty");
        fs::create_dir_all(&anchor).unwrap();

        let (status, restored) = cache.fetch(&anchor, "unknown").await.unwrap();
        assert!(!status.hit);
        assert!(restored.is_empty());
        assert_eq!(fs::read_dir(&anchor).unwrap().count(), 0);
        assert_eq!(fs::read_dir(cache.cache_dir()).unwrap().count(), 0);
        assert_eq!(recorder.events()[0].event, CacheEventKind::Miss);
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_an_error() {
        let (temp, cache, _) = setup();
        fs::write(cache.cache_dir().join("bad.tar.zst"), b"garbage").unwrap();

        let err = cache.fetch(temp.path(), "bad").await.unwrap_err();
        match err {
            CacheError::Corrupt { hash, tier, .. } => {
                assert_eq!(hash, "bad");
                assert_eq!(tier, CacheSource::Fs);
            }
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_archive_without_metadata_is_a_hit() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "h2", 900, &files).await.unwrap();
        fs::remove_file(cache.cache_dir().join("h2-meta.json")).unwrap();

        let status = cache.exists("h2").await.unwrap();
        assert_eq!(status, ItemStatus::hit(CacheSource::Fs, 0));
    }

    #[tokio::test]
    async fn test_uncompressed_put_replaces_compressed() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "h3", 1, &files).await.unwrap();

        let plain = cache.clone().with_compression(false);
        plain.put(&anchor, "h3", 2, &files).await.unwrap();
        assert!(cache.cache_dir().join("h3.tar").exists());
        assert!(!cache.cache_dir().join("h3.tar.zst").exists());
        assert_eq!(cache.exists("h3").await.unwrap().time_saved, 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_hash() {
        let (temp, cache, _) = setup();
        assert!(matches!(
            cache.fetch(temp.path(), "../escape").await,
            Err(CacheError::MalformedName(_))
        ));
        assert!(cache.exists("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_clean_removes_leftovers_only() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "keep", 1, &files).await.unwrap();
        fs::write(cache.cache_dir().join(".tmpAbC123"), b"partial").unwrap();
        fs::write(cache.cache_dir().join("orphan-meta.json"), b"{}").unwrap();

        cache.clean(&anchor).await.unwrap();

        let mut names: Vec<String> = fs::read_dir(cache.cache_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["keep-meta.json", "keep.tar.zst"]);
    }

    #[tokio::test]
    async fn test_clean_all() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "a", 1, &files).await.unwrap();
        cache.put(&anchor, "b", 1, &files).await.unwrap();

        cache.clean_all().await.unwrap();
        assert!(!cache.exists("a").await.unwrap().hit);
        assert_eq!(cache.status().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_status_and_prune() {
        let (temp, cache, _) = setup();
        let anchor = temp.path().join("repo");
        let files = write_outputs(&anchor);
        cache.put(&anchor, "a", 1, &files).await.unwrap();
        cache.put(&anchor, "b", 1, &files).await.unwrap();

        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.total_size > 0);

        let kept = cache.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!((kept.total, kept.removed, kept.kept), (2, 0, 2));

        let pruned = cache.prune(Duration::ZERO).unwrap();
        assert_eq!(pruned.removed, 2);
        assert_eq!(fs::read_dir(cache.cache_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_status_of_missing_dir() {
        let temp = TempDir::new().unwrap();
        let cache = FsCache::new(temp.path().join("c"), Arc::new(MemoryRecorder::default())).unwrap();
        fs::remove_dir(cache.cache_dir()).unwrap();
        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
    }

    #[test]
    fn test_cache_stats_formatted_size() {
        let stats = CacheStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");

        let stats = CacheStats {
            entries: 0,
            total_size: 500,
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
