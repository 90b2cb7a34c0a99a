//! Remote artifact cache tier
//!
//! Artifacts are always zstd-compressed cache items. The transport is behind
//! [`ArtifactClient`] so that the tier can be exercised without a network.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};

use crate::analytics::{CacheEvent, Recorder};
use crate::cacheitem::{CacheReader, CacheWriter};
use crate::error::{CacheError, Result};
use crate::{Cache, CacheSource, ItemStatus};

const DURATION_HEADER: &str = "x-artifact-duration";

/// A downloaded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub body: Vec<u8>,
    /// Milliseconds the producing task took
    pub duration: u64,
}

/// Transport to an artifact store
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Download an artifact; `None` when it does not exist
    async fn get(&self, hash: &str) -> Result<Option<Artifact>>;

    /// Upload an artifact
    async fn put(&self, hash: &str, body: Vec<u8>, duration: u64) -> Result<()>;

    /// Probe for an artifact, returning its recorded duration
    async fn head(&self, hash: &str) -> Result<Option<u64>>;
}

/// HTTP artifact API client
///
/// Speaks `GET/PUT/HEAD {url}/v8/artifacts/{hash}` with a bearer token.
pub struct HttpArtifactClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    team: Option<String>,
}

impl HttpArtifactClient {
    /// Create a new client
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        team: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(CacheError::Configuration(
                "remote cache URL is empty".to_string(),
            ));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            team,
        })
    }

    fn artifact_url(&self, hash: &str) -> String {
        match &self.team {
            Some(team) => format!("{}/v8/artifacts/{}?teamId={}", self.base_url, hash, team),
            None => format!("{}/v8/artifacts/{}", self.base_url, hash),
        }
    }

    fn request(&self, method: reqwest::Method, hash: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.artifact_url(hash));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn duration_of(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    async fn api_error(response: reqwest::Response) -> CacheError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        CacheError::Api { status, message }
    }
}

#[async_trait]
impl ArtifactClient for HttpArtifactClient {
    async fn get(&self, hash: &str) -> Result<Option<Artifact>> {
        let response = self.request(reqwest::Method::GET, hash).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let duration = Self::duration_of(&response);
        let body = response.bytes().await?.to_vec();
        Ok(Some(Artifact { body, duration }))
    }

    async fn put(&self, hash: &str, body: Vec<u8>, duration: u64) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, hash)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(DURATION_HEADER, duration.to_string())
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }

    async fn head(&self, hash: &str) -> Result<Option<u64>> {
        let response = self.request(reqwest::Method::HEAD, hash).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(Some(Self::duration_of(&response)))
    }
}

/// Cache tier backed by an [`ArtifactClient`]
///
/// Transport failures never fail a run: lookups degrade to misses and
/// uploads to warnings. An artifact that downloads but cannot be restored is
/// reported as corrupt.
#[derive(Clone)]
pub struct RemoteCache {
    client: Arc<dyn ArtifactClient>,
    recorder: Arc<dyn Recorder>,
}

impl RemoteCache {
    pub fn new(client: Arc<dyn ArtifactClient>, recorder: Arc<dyn Recorder>) -> Self {
        Self { client, recorder }
    }

    /// Build the compressed archive for `files` in memory
    fn pack(anchor: &Path, files: &[PathBuf]) -> Result<Vec<u8>> {
        let staging = tempfile::tempdir()?;
        let path = staging.path().join("artifact.tar.zst");
        let mut writer = CacheWriter::create(&path)?;
        for file in files {
            writer.add_file(anchor, file)?;
        }
        writer.close()?;
        Ok(std::fs::read(&path)?)
    }

    fn unpack(anchor: &Path, body: Vec<u8>) -> Result<Vec<PathBuf>> {
        let decoder = zstd::Decoder::new(Cursor::new(body))?;
        CacheReader::from_reader(Box::new(decoder)).restore(anchor)
    }

    fn miss(&self, hash: &str) -> ItemStatus {
        self.recorder.record(CacheEvent::miss(CacheSource::Remote, hash));
        ItemStatus::miss()
    }
}

#[async_trait]
impl Cache for RemoteCache {
    #[instrument(skip(self, files), fields(files = files.len()))]
    async fn put(&self, anchor: &Path, hash: &str, duration_ms: u64, files: &[PathBuf]) -> Result<()> {
        let anchor = anchor.to_path_buf();
        let files = files.to_vec();
        let body = tokio::task::spawn_blocking(move || Self::pack(&anchor, &files))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;

        let size = body.len();
        match self.client.put(hash, body, duration_ms).await {
            Ok(()) => debug!(hash, size, "Uploaded artifact"),
            Err(e) => warn!(hash, error = %e, "Failed to upload artifact to remote cache"),
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch(&self, anchor: &Path, hash: &str) -> Result<(ItemStatus, Vec<PathBuf>)> {
        let artifact = match self.client.get(hash).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return Ok((self.miss(hash), Vec::new())),
            Err(e) if e.is_transport() => {
                warn!(hash, error = %e, "Remote cache unavailable, treating as miss");
                return Ok((self.miss(hash), Vec::new()));
            }
            Err(e) => return Err(e),
        };

        let duration = artifact.duration;
        let target = anchor.to_path_buf();
        let restored = tokio::task::spawn_blocking(move || Self::unpack(&target, artifact.body))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
            .map_err(|e| CacheError::corrupt(hash, CacheSource::Remote, e))?;

        self.recorder
            .record(CacheEvent::hit(CacheSource::Remote, hash, duration));
        Ok((ItemStatus::hit(CacheSource::Remote, duration), restored))
    }

    async fn exists(&self, hash: &str) -> Result<ItemStatus> {
        match self.client.head(hash).await {
            Ok(Some(duration)) => Ok(ItemStatus::hit(CacheSource::Remote, duration)),
            Ok(None) => Ok(ItemStatus::miss()),
            Err(e) if e.is_transport() => {
                warn!(hash, error = %e, "Remote cache unavailable, treating as miss");
                Ok(ItemStatus::miss())
            }
            Err(e) => Err(e),
        }
    }

    async fn clean(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn clean_all(&self) -> Result<()> {
        info!("Remote cache items are not removed by clean");
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory artifact store
    #[derive(Default)]
    pub(crate) struct MemoryArtifactClient {
        pub(crate) artifacts: Mutex<HashMap<String, Artifact>>,
        pub(crate) offline: bool,
    }

    impl MemoryArtifactClient {
        pub(crate) fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        fn check(&self) -> Result<()> {
            if self.offline {
                Err(CacheError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ArtifactClient for MemoryArtifactClient {
        async fn get(&self, hash: &str) -> Result<Option<Artifact>> {
            self.check()?;
            Ok(self.artifacts.lock().unwrap().get(hash).cloned())
        }

        async fn put(&self, hash: &str, body: Vec<u8>, duration: u64) -> Result<()> {
            self.check()?;
            self.artifacts
                .lock()
                .unwrap()
                .insert(hash.to_string(), Artifact { body, duration });
            Ok(())
        }

        async fn head(&self, hash: &str) -> Result<Option<u64>> {
            self.check()?;
            Ok(self.artifacts.lock().unwrap().get(hash).map(|a| a.duration))
        }
    }
}
