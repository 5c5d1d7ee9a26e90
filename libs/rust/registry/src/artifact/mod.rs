//! Artifact store: per-version bundles and the two-level pointer indirection.
//!
//! A ledger row's `artifact_pointer` is first turned into an [`ArtifactLocation`]
//! by a [`PointerResolver`]. With the pointer-file resolver that means reading
//! `<root>/<model_id>/v<N>/model_path.txt`, so an artifact can move (say, to
//! object storage) by rewriting one small file instead of the ledger. The
//! location is then fetched by an [`ArtifactLocator`] and decoded by an
//! [`ArtifactLoader`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{ModelRecord, Version};

mod locator;
mod predictor;

pub use locator::{ArtifactLocator, LocalPathLocator, RemoteKeyLocator, RoutingLocator};
pub use predictor::{ArtifactLoader, JsonArtifactLoader, ModelSpec, Predictor, PredictorArtifact, RobustScaler, ARTIFACT_FORMAT};

pub const POINTER_FILE: &str = "model_path.txt";
pub const FEATURES_FILE: &str = "model_features.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("pointer file {0} not found")]
    PointerMissing(PathBuf),
    #[error("pointer file {0} is empty")]
    PointerEmpty(PathBuf),
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("reading {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("remote fetch of {url} failed: {reason}")]
    Remote { url: String, reason: String },
    #[error("remote artifact store not configured for {0}")]
    RemoteUnconfigured(String),
    #[error("artifact is not a loadable predictor: {0}")]
    Decode(String),
    #[error("feature manifest {path} lists {manifest:?} but the ledger declares {declared:?}")]
    ManifestMismatch { path: PathBuf, manifest: Vec<String>, declared: Vec<String> },
    #[error("artifact resolution task failed: {0}")]
    Task(String),
}

/// Where the serialized predictor bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    /// Object-store key, e.g. `s3://bucket/key` or `remote://key`.
    RemoteKey { bucket: Option<String>, key: String },
    /// Fully qualified `http(s)://` URL.
    Url(String),
}

impl ArtifactLocation {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Self::Url(raw.to_string());
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            return Self::RemoteKey { bucket: Some(bucket.to_string()), key: key.to_string() };
        }
        if let Some(key) = raw.strip_prefix("remote://") {
            return Self::RemoteKey { bucket: None, key: key.to_string() };
        }
        Self::Local(PathBuf::from(raw))
    }
}

impl std::fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(p) => write!(f, "{}", p.display()),
            Self::RemoteKey { bucket: Some(b), key } => write!(f, "s3://{b}/{key}"),
            Self::RemoteKey { bucket: None, key } => write!(f, "remote://{key}"),
            Self::Url(u) => f.write_str(u),
        }
    }
}

/// First level of the indirection: ledger row -> artifact location.
pub trait PointerResolver: Send + Sync {
    fn locate(&self, record: &ModelRecord) -> Result<ArtifactLocation, ArtifactError>;
}

/// Reads the location from the version directory's pointer file.
pub struct PointerFileResolver {
    store: ArtifactStore,
}

impl PointerFileResolver {
    pub fn new(store: ArtifactStore) -> Self { Self { store } }
}

impl PointerResolver for PointerFileResolver {
    fn locate(&self, record: &ModelRecord) -> Result<ArtifactLocation, ArtifactError> {
        let raw = self.store.read_pointer(&record.model_id, record.version)?;
        Ok(ArtifactLocation::parse(&raw))
    }
}

/// Treats the ledger's `artifact_pointer` as the location itself.
pub struct DirectPointerResolver;

impl PointerResolver for DirectPointerResolver {
    fn locate(&self, record: &ModelRecord) -> Result<ArtifactLocation, ArtifactError> {
        Ok(ArtifactLocation::parse(&record.artifact_pointer))
    }
}

/// Version directories under a root: `<root>/<model_id>/v<N>/{model_path.txt, model_features.json}`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn version_dir(&self, model_id: &str, version: Version) -> PathBuf {
        self.root.join(model_id).join(version.to_string())
    }

    /// Write the bundle for `record` into a private staging directory. Nothing is
    /// visible under the version directory until [`StagedBundle::publish`].
    pub fn stage(&self, record: &ModelRecord) -> Result<StagedBundle, ArtifactError> {
        let model_dir = self.root.join(&record.model_id);
        let staging = model_dir.join(format!(".staging-{}-{}", record.version, uuid::Uuid::new_v4().simple()));
        let io = |path: &Path, source| ArtifactError::Io { path: path.display().to_string(), source };
        fs::create_dir_all(&staging).map_err(|e| io(&staging, e))?;
        let bundle = StagedBundle { staging, target: self.version_dir(&record.model_id, record.version), published: false };
        let pointer = bundle.staging.join(POINTER_FILE);
        fs::write(&pointer, record.artifact_pointer.as_bytes()).map_err(|e| io(&pointer, e))?;
        let features = bundle.staging.join(FEATURES_FILE);
        let json = serde_json::to_vec(&record.features).map_err(|e| ArtifactError::Decode(e.to_string()))?;
        fs::write(&features, json).map_err(|e| io(&features, e))?;
        Ok(bundle)
    }

    pub fn read_pointer(&self, model_id: &str, version: Version) -> Result<String, ArtifactError> {
        let path = self.version_dir(model_id, version).join(POINTER_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ArtifactError::PointerMissing(path)),
            Err(source) => return Err(ArtifactError::Io { path: path.display().to_string(), source }),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() { return Err(ArtifactError::PointerEmpty(path)); }
        Ok(trimmed.to_string())
    }

    /// Repoint an existing version at a new artifact location without touching the ledger.
    pub fn repoint(&self, model_id: &str, version: Version, location: &ArtifactLocation) -> Result<(), ArtifactError> {
        let dir = self.version_dir(model_id, version);
        let path = dir.join(POINTER_FILE);
        if !path.exists() { return Err(ArtifactError::PointerMissing(path)); }
        let tmp = dir.join(format!(".{POINTER_FILE}.{}", uuid::Uuid::new_v4().simple()));
        let io = |source| ArtifactError::Io { path: path.display().to_string(), source };
        fs::write(&tmp, location.to_string()).map_err(io)?;
        fs::rename(&tmp, &path).map_err(io)?;
        debug!(model_id, %version, %location, "artifact repointed");
        Ok(())
    }

    /// Rebuild the version directory from its ledger record when the pointer file
    /// is gone. An existing pointer file is left alone so a repoint is never undone.
    pub fn restore(&self, record: &ModelRecord) -> Result<PathBuf, ArtifactError> {
        let dir = self.version_dir(&record.model_id, record.version);
        if dir.join(POINTER_FILE).is_file() {
            return Ok(dir);
        }
        let restored = self.stage(record)?.publish()?;
        info!(model_id = %record.model_id, version = %record.version, "version bundle restored");
        Ok(restored)
    }

    /// Feature manifest written at registration, if the version directory has one.
    pub fn read_manifest(&self, model_id: &str, version: Version) -> Result<Option<Vec<String>>, ArtifactError> {
        let path = self.version_dir(model_id, version).join(FEATURES_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| ArtifactError::Decode(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Io { path: path.display().to_string(), source }),
        }
    }

    /// Fails when the manifest on disk disagrees with the declared feature order.
    pub fn verify_manifest(&self, record: &ModelRecord) -> Result<(), ArtifactError> {
        match self.read_manifest(&record.model_id, record.version)? {
            Some(manifest) if manifest != record.features => Err(ArtifactError::ManifestMismatch {
                path: self.version_dir(&record.model_id, record.version).join(FEATURES_FILE),
                manifest,
                declared: record.features.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// A bundle written to staging. Dropped without publishing, it is removed.
#[derive(Debug)]
pub struct StagedBundle {
    staging: PathBuf,
    target: PathBuf,
    published: bool,
}

impl StagedBundle {
    pub fn publish(mut self) -> Result<PathBuf, ArtifactError> {
        if self.target.exists() {
            warn!(dir = %self.target.display(), "replacing orphaned version directory");
            fs::remove_dir_all(&self.target).map_err(|source| ArtifactError::Io { path: self.target.display().to_string(), source })?;
        }
        fs::rename(&self.staging, &self.target).map_err(|source| ArtifactError::Io { path: self.target.display().to_string(), source })?;
        self.published = true;
        Ok(self.target.clone())
    }
}

impl Drop for StagedBundle {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}
