//! Sidecar metadata stored next to each filesystem cache item

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Result;

/// `<hash>-meta.json` contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub hash: String,
    /// Milliseconds the task took when the item was produced
    pub duration: u64,
}

impl CacheMetadata {
    pub fn new(hash: impl Into<String>, duration: u64) -> Self {
        Self {
            hash: hash.into(),
            duration,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write through a temporary file so readers never observe a partial file
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut temp, self)?;
        temp.flush()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
