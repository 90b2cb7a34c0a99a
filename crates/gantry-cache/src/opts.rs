//! Cache construction

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::analytics::Recorder;
use crate::error::{CacheError, Result};
use crate::fs::FsCache;
use crate::multiplexer::{CacheBackend, CacheMultiplexer};
use crate::noop::NoopCache;
use crate::remote::{ArtifactClient, HttpArtifactClient, RemoteCache};

/// Remote tier settings
#[derive(Debug, Clone)]
pub struct RemoteCacheOpts {
    pub url: String,
    pub token: Option<String>,
    pub team: Option<String>,
    pub timeout: Duration,
}

/// Which tiers to build and where
#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Local cache directory
    pub dir: PathBuf,
    /// Disable caching entirely
    pub disabled: bool,
    /// Use only the remote tier
    pub skip_filesystem: bool,
    pub remote: Option<RemoteCacheOpts>,
}

impl CacheOpts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            disabled: false,
            skip_filesystem: false,
            remote: None,
        }
    }
}

/// Build the backend described by `opts`
pub fn new_cache(opts: &CacheOpts, recorder: Arc<dyn Recorder>) -> Result<CacheBackend> {
    let client = match &opts.remote {
        Some(remote) if !opts.disabled => Some(Arc::new(HttpArtifactClient::new(
            remote.url.clone(),
            remote.token.clone(),
            remote.team.clone(),
            remote.timeout,
        )?) as Arc<dyn ArtifactClient>),
        _ => None,
    };
    new_cache_with_client(opts, client, recorder)
}

/// Build a backend with an explicit artifact transport
pub fn new_cache_with_client(
    opts: &CacheOpts,
    client: Option<Arc<dyn ArtifactClient>>,
    recorder: Arc<dyn Recorder>,
) -> Result<CacheBackend> {
    if opts.disabled {
        debug!("Caching disabled");
        return Ok(CacheBackend::Noop(NoopCache));
    }

    let remote = client.map(|client| RemoteCache::new(client, recorder.clone()));
    let backend = match (opts.skip_filesystem, remote) {
        (true, Some(remote)) => CacheBackend::Remote(remote),
        (true, None) => {
            return Err(CacheError::Configuration(
                "remote-only caching requested but no remote cache is configured".to_string(),
            ))
        }
        (false, Some(remote)) => CacheBackend::Multiplexed(CacheMultiplexer::new(
            FsCache::new(&opts.dir, recorder)?,
            remote,
        )),
        (false, None) => CacheBackend::Fs(FsCache::new(&opts.dir, recorder)?),
    };

    debug!(kind = backend.kind(), dir = %opts.dir.display(), "Cache initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MemoryRecorder;
    use crate::remote::testing::MemoryArtifactClient;
    use tempfile::TempDir;

    fn recorder() -> Arc<dyn Recorder> {
        Arc::new(MemoryRecorder::default())
    }

    fn client() -> Option<Arc<dyn ArtifactClient>> {
        Some(Arc::new(MemoryArtifactClient::default()))
    }

    #[test]
    fn test_backend_selection() {
        let temp = TempDir::new().unwrap();
        let mut opts = CacheOpts::new(temp.path().join("cache"));

        let local = new_cache_with_client(&opts, None, recorder()).unwrap();
        assert_eq!(local.kind(), "local");
        assert!(temp.path().join("cache").is_dir());

        let both = new_cache_with_client(&opts, client(), recorder()).unwrap();
        assert_eq!(both.kind(), "local+remote");

        opts.skip_filesystem = true;
        let remote = new_cache_with_client(&opts, client(), recorder()).unwrap();
        assert_eq!(remote.kind(), "remote");
        assert!(matches!(
            new_cache_with_client(&opts, None, recorder()),
            Err(CacheError::Configuration(_))
        ));

        opts.disabled = true;
        let noop = new_cache_with_client(&opts, client(), recorder()).unwrap();
        assert_eq!(noop.kind(), "disabled");
    }

    #[test]
    fn test_new_cache_with_http_remote() {
        let temp = TempDir::new().unwrap();
        let mut opts = CacheOpts::new(temp.path().join("cache"));
        opts.remote = Some(RemoteCacheOpts {
            url: "http://localhost:9".to_string(),
            token: None,
            team: None,
            timeout: Duration::from_secs(1),
        });
        let backend = new_cache(&opts, recorder()).unwrap();
        assert_eq!(backend.kind(), "local+remote");
    }
}
