//! Cache used when caching is disabled

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::{Cache, ItemStatus};

/// Stores nothing and always misses
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn put(&self, _anchor: &Path, _hash: &str, _duration_ms: u64, _files: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _anchor: &Path, _hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        Ok((ItemStatus::miss(), Vec::new()))
    }

    async fn exists(&self, _hash: &str) -> Result<ItemStatus> {
        Ok(ItemStatus::miss())
    }

    async fn clean(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn clean_all(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}
