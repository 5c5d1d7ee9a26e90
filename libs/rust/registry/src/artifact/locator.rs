//! Second level of the indirection: artifact location -> bytes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use valuation_resilience::CircuitBreaker;

use super::{ArtifactError, ArtifactLocation};

#[async_trait]
pub trait ArtifactLocator: Send + Sync {
    async fn resolve(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError>;
}

/// Local filesystem paths; relative paths are taken against `base`.
#[derive(Debug, Clone, Default)]
pub struct LocalPathLocator {
    base: Option<std::path::PathBuf>,
}

impl LocalPathLocator {
    pub fn new() -> Self { Self::default() }
    pub fn with_base(base: impl Into<std::path::PathBuf>) -> Self { Self { base: Some(base.into()) } }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        let full = match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::NotFound(full.display().to_string())),
            Err(source) => Err(ArtifactError::Io { path: full.display().to_string(), source }),
        }
    }
}

#[async_trait]
impl ArtifactLocator for LocalPathLocator {
    async fn resolve(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        match location {
            ArtifactLocation::Local(path) => self.read(path).await,
            other => Err(ArtifactError::RemoteUnconfigured(other.to_string())),
        }
    }
}

/// Object-store keys and URLs over HTTP, guarded by a circuit breaker so a dead
/// store fails requests fast instead of stalling every prediction.
pub struct RemoteKeyLocator {
    client: reqwest::Client,
    base_url: Option<String>,
    breaker: CircuitBreaker,
}

impl RemoteKeyLocator {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArtifactError::Remote { url: base_url.clone().unwrap_or_default(), reason: e.to_string() })?;
        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            breaker: CircuitBreaker::new("artifact-remote", 5, Duration::from_secs(10)),
        })
    }

    pub fn url_for(&self, location: &ArtifactLocation) -> Result<String, ArtifactError> {
        match location {
            ArtifactLocation::Url(u) => Ok(u.clone()),
            ArtifactLocation::RemoteKey { bucket, key } => {
                let base = self.base_url.as_deref().ok_or_else(|| ArtifactError::RemoteUnconfigured(location.to_string()))?;
                Ok(match bucket {
                    Some(b) => format!("{base}/{b}/{key}"),
                    None => format!("{base}/{key}"),
                })
            }
            ArtifactLocation::Local(p) => Err(ArtifactError::Decode(format!("{} is not a remote location", p.display()))),
        }
    }

    /// `Ok(None)` on a 404.
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, String> {
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND { return Ok(None); }
        if !status.is_success() { return Err(format!("HTTP {status}")); }
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl ArtifactLocator for RemoteKeyLocator {
    async fn resolve(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        let url = self.url_for(location)?;
        self.breaker.allow().map_err(|e| ArtifactError::Remote { url: url.clone(), reason: e.to_string() })?;
        debug!(%url, "fetching remote artifact");
        match self.fetch(&url).await {
            Ok(Some(bytes)) => { self.breaker.record_success(); Ok(bytes) }
            // a clean 404 means the store is healthy
            Ok(None) => { self.breaker.record_success(); Err(ArtifactError::NotFound(url)) }
            Err(reason) => {
                self.breaker.record_failure();
                warn!(%url, %reason, "remote artifact fetch failed");
                Err(ArtifactError::Remote { url, reason })
            }
        }
    }
}

/// Dispatches on the location kind: local paths to the local locator, keys and
/// URLs to the remote one when configured.
pub struct RoutingLocator {
    local: LocalPathLocator,
    remote: Option<Arc<RemoteKeyLocator>>,
}

impl RoutingLocator {
    pub fn new(local: LocalPathLocator, remote: Option<Arc<RemoteKeyLocator>>) -> Self { Self { local, remote } }
    pub fn local_only() -> Self { Self::new(LocalPathLocator::new(), None) }
}

#[async_trait]
impl ArtifactLocator for RoutingLocator {
    async fn resolve(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        match (location, &self.remote) {
            (ArtifactLocation::Local(_), _) => self.local.resolve(location).await,
            (_, Some(remote)) => remote.resolve(location).await,
            (_, None) => Err(ArtifactError::RemoteUnconfigured(location.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_locator_reads_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.json"), b"{}").unwrap();
        let loc = LocalPathLocator::with_base(dir.path());
        let bytes = loc.resolve(&ArtifactLocation::parse("m.json")).await.unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[tokio::test]
    async fn missing_local_artifact_is_not_found() {
        let err = LocalPathLocator::new().resolve(&ArtifactLocation::parse("/definitely/not/here.json")).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn routing_without_remote_rejects_keys() {
        let err = RoutingLocator::local_only().resolve(&ArtifactLocation::parse("s3://b/k")).await.unwrap_err();
        assert!(matches!(err, ArtifactError::RemoteUnconfigured(_)));
    }

    #[test]
    fn remote_urls_are_built_from_base() {
        let remote = RemoteKeyLocator::new(Some("http://store:9000/".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(remote.url_for(&ArtifactLocation::parse("s3://models/home/v1.json")).unwrap(), "http://store:9000/models/home/v1.json");
        assert_eq!(remote.url_for(&ArtifactLocation::parse("remote://home/v1.json")).unwrap(), "http://store:9000/home/v1.json");
        let bare = RemoteKeyLocator::new(None, Duration::from_secs(1)).unwrap();
        assert!(bare.url_for(&ArtifactLocation::parse("s3://b/k")).is_err());
        assert_eq!(bare.url_for(&ArtifactLocation::parse("https://cdn/x")).unwrap(), "https://cdn/x");
    }

    #[tokio::test]
    async fn unreachable_store_is_remote_error() {
        let remote = RemoteKeyLocator::new(Some("http://127.0.0.1:9".into()), Duration::from_millis(200)).unwrap();
        let err = remote.resolve(&ArtifactLocation::parse("remote://k")).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Remote { .. }));
    }
}
