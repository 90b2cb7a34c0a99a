//! Cache error types

use std::path::PathBuf;

use thiserror::Error;

use crate::CacheSource;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("Cache metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// A file that is neither a regular file, a directory nor a symlink
    #[error("Unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),

    /// An archive entry name that is absolute or escapes the anchor
    #[error("Malformed archive entry name: {0}")]
    MalformedName(String),

    /// An archive was found but could not be opened or restored
    #[error("Cache item {hash} in the {tier} cache is corrupt: {source}")]
    Corrupt {
        hash: String,
        tier: CacheSource,
        #[source]
        source: Box<CacheError>,
    },

    /// HTTP transport error
    #[error("Remote cache request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the remote cache API
    #[error("Remote cache API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Remote cache misconfiguration
    #[error("Remote cache configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Wrap an open/restore failure as a corrupt-item error for a tier
    pub fn corrupt(hash: &str, tier: CacheSource, source: CacheError) -> Self {
        Self::Corrupt {
            hash: hash.to_string(),
            tier,
            source: Box::new(source),
        }
    }

    /// Whether this error came from the network rather than the data
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Api { .. })
    }
}
