//! Gantry Cache - content-addressable task output cache
//!
//! Task outputs are stored as [`cacheitem`] archives keyed by the task hash.
//! Backends implement the [`Cache`] trait:
//! - [`FsCache`]: archives in a local directory
//! - [`RemoteCache`]: an HTTP artifact service
//! - [`NoopCache`]: always misses
//! - [`CacheMultiplexer`]: local-first fan-out over the other two
//!
//! Use [`new_cache`] to build the backend described by [`CacheOpts`].

pub mod analytics;
pub mod cacheitem;
pub mod error;
pub mod fs;
pub mod metadata;
pub mod multiplexer;
pub mod noop;
pub mod opts;
pub mod remote;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use analytics::{CacheEvent, CacheEventKind, MemoryRecorder, Recorder, TracingRecorder};
pub use error::{CacheError, Result};
pub use fs::{CacheStats, FsCache, PruneStats};
pub use multiplexer::{CacheBackend, CacheMultiplexer};
pub use noop::NoopCache;
pub use opts::{new_cache, new_cache_with_client, CacheOpts, RemoteCacheOpts};
pub use remote::{Artifact, ArtifactClient, HttpArtifactClient, RemoteCache};

/// Which tier answered a cache request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Local filesystem cache
    Fs,
    /// Remote artifact cache
    Remote,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fs => write!(f, "fs"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    pub hit: bool,
    pub source: Option<CacheSource>,
    /// Milliseconds the original task run took
    pub time_saved: u64,
}

impl ItemStatus {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn hit(source: CacheSource, time_saved: u64) -> Self {
        Self {
            hit: true,
            source: Some(source),
            time_saved,
        }
    }
}

/// A content-addressable store of task outputs
#[async_trait]
pub trait Cache: Send + Sync {
    /// Archive `files` (relative to `anchor`) under `hash`
    async fn put(&self, anchor: &Path, hash: &str, duration_ms: u64, files: &[PathBuf])
        -> Result<()>;

    /// Restore the item for `hash` under `anchor`.
    ///
    /// Returns the restored anchor-relative paths; on a miss the list is
    /// empty and nothing is written.
    async fn fetch(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)>;

    /// Check for an item without restoring it
    async fn exists(&self, hash: &str) -> Result<ItemStatus>;

    /// Tidy leftovers of interrupted writes. `dir` is the anchor the caller
    /// works in; backends without local state ignore it.
    async fn clean(&self, dir: &Path) -> Result<()>;

    /// Remove every stored item
    async fn clean_all(&self) -> Result<()>;

    /// Flush pending work; the cache must not be used afterwards
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_constructors() {
        assert!(!ItemStatus::miss().hit);
        assert_eq!(ItemStatus::miss().source, None);

        let hit = ItemStatus::hit(CacheSource::Remote, 1200);
        assert!(hit.hit);
        assert_eq!(hit.source, Some(CacheSource::Remote));
        assert_eq!(hit.time_saved, 1200);
    }

    #[test]
    fn test_source_serialization() {
        assert_eq!(serde_json::to_string(&CacheSource::Fs).unwrap(), "\"fs\"");
        assert_eq!(CacheSource::Remote.to_string(), "remote");
    }
}
