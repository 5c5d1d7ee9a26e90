//! The four operations the presentation layer may call: register, latest,
//! versions and predict. Nothing outside this facade touches ledger internals.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use valuation_resilience::{retry_if, RetryConfig};

use crate::allocator::VersionAllocator;
use crate::artifact::{
    ArtifactLoader, ArtifactLocation, ArtifactLocator, ArtifactStore, DirectPointerResolver, JsonArtifactLoader, PointerFileResolver,
    PointerResolver, RoutingLocator,
};
use crate::cache::PredictorCache;
use crate::error::{RegistryError, Result};
use crate::ledger::Ledger;
use crate::metrics::METRICS;
use crate::reconcile::{FeatureReconciler, PredictionRequest};
use crate::record::{ModelRecord, NewModel, Version};
use crate::reference::ReferenceData;
use crate::resolver::{InferenceResolver, Prediction};

/// How a ledger row's `artifact_pointer` is turned into a location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerMode {
    /// Read `model_path.txt` from the version directory.
    #[default]
    PointerFile,
    /// Use the ledger's pointer as the location.
    Direct,
}

pub struct ModelServiceBuilder {
    ledger: Ledger,
    reference: Arc<dyn ReferenceData>,
    store: Option<ArtifactStore>,
    pointer_mode: PointerMode,
    locator: Option<Arc<dyn ArtifactLocator>>,
    loader: Arc<dyn ArtifactLoader>,
    retry: RetryConfig,
    cache: bool,
}

impl ModelServiceBuilder {
    /// Version bundles are written under `store` and read back for the pointer file and manifest.
    pub fn artifact_store(mut self, store: ArtifactStore) -> Self { self.store = Some(store); self }
    pub fn pointer_mode(mut self, mode: PointerMode) -> Self { self.pointer_mode = mode; self }
    pub fn locator(mut self, locator: Arc<dyn ArtifactLocator>) -> Self { self.locator = Some(locator); self }
    pub fn loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self { self.loader = loader; self }
    pub fn retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }
    pub fn cache(mut self, enabled: bool) -> Self { self.cache = enabled; self }

    pub fn build(self) -> Result<ModelService> {
        let pointers: Arc<dyn PointerResolver> = match (self.pointer_mode, &self.store) {
            (PointerMode::PointerFile, Some(store)) => Arc::new(PointerFileResolver::new(store.clone())),
            (PointerMode::PointerFile, None) => {
                return Err(RegistryError::InvalidRequest("pointer_file mode requires an artifact store".into()))
            }
            (PointerMode::Direct, _) => Arc::new(DirectPointerResolver),
        };
        let locator = self.locator.unwrap_or_else(|| Arc::new(RoutingLocator::local_only()));
        let cache = Arc::new(PredictorCache::new(self.cache));
        let mut resolver = InferenceResolver::new(self.ledger.clone(), pointers, locator, self.loader, FeatureReconciler::new(self.reference))
            .with_cache(cache.clone());
        if let Some(store) = &self.store {
            resolver = resolver.with_manifest_check(store.clone());
        }
        Ok(ModelService { ledger: self.ledger, store: self.store, resolver, cache, retry: self.retry })
    }
}

pub struct ModelService {
    ledger: Ledger,
    store: Option<ArtifactStore>,
    resolver: InferenceResolver,
    cache: Arc<PredictorCache>,
    retry: RetryConfig,
}

impl ModelService {
    pub fn builder(ledger: Ledger, reference: Arc<dyn ReferenceData>) -> ModelServiceBuilder {
        ModelServiceBuilder {
            ledger,
            reference,
            store: None,
            pointer_mode: PointerMode::Direct,
            locator: None,
            loader: Arc::new(JsonArtifactLoader),
            retry: RetryConfig::default(),
            cache: true,
        }
    }

    pub fn join_key(&self) -> &str { self.resolver.reconciler().join_key() }

    /// Allocate the next version and commit it. Lost races are retried per the
    /// retry config; with retries disabled the caller sees `REGISTRATION_CONFLICT`.
    #[instrument(skip(self, new), fields(model_id = %new.model_id))]
    pub async fn register(&self, new: NewModel) -> Result<ModelRecord> {
        new.validate()?;
        let record = retry_if(
            &self.retry,
            |attempt| {
                let (ledger, store, new) = (self.ledger.clone(), self.store.clone(), new.clone());
                async move {
                    match tokio::task::spawn_blocking(move || register_once(&ledger, store.as_ref(), new, attempt)).await {
                        Ok(result) => result,
                        Err(e) => Err(RegistryError::Storage(format!("registration task failed: {e}"))),
                    }
                }
            },
            RegistryError::is_retryable,
        )
        .await?;
        self.cache.evict_older(&record.model_id, record.version);
        METRICS.registrations_total.inc();
        info!(model_id = %record.model_id, version = %record.version, features = record.features.len(), "model registered");
        Ok(record)
    }

    /// Highest registered version; `ModelNotFound` when none exist.
    pub fn latest(&self, model_id: &str) -> Result<ModelRecord> {
        self.ledger.latest(model_id)?.ok_or_else(|| RegistryError::ModelNotFound { model_id: model_id.to_string() })
    }

    /// Ascending; `ModelNotFound` when none exist.
    pub fn versions(&self, model_id: &str) -> Result<Vec<Version>> {
        let versions = self.ledger.versions(model_id)?;
        if versions.is_empty() {
            return Err(RegistryError::ModelNotFound { model_id: model_id.to_string() });
        }
        Ok(versions)
    }

    pub fn models(&self) -> Result<Vec<ModelRecord>> { self.ledger.models() }

    /// Move a registered version's artifact without a ledger write. The cached
    /// predictor for that version is dropped so the next prediction reloads.
    pub fn repoint(&self, model_id: &str, version: Version, artifact_pointer: &str) -> Result<ModelRecord> {
        let (store, record) = self.registered(model_id, version)?;
        let location = ArtifactLocation::parse(artifact_pointer);
        store.repoint(model_id, version, &location).map_err(|e| RegistryError::Storage(e.to_string()))?;
        self.cache.evict(model_id, version);
        info!(model_id, %version, %location, "artifact pointer moved");
        Ok(record)
    }

    /// Recreate a registered version's bundle from its ledger record when the
    /// version directory was lost. Leaves an existing pointer file untouched.
    pub fn restore_bundle(&self, model_id: &str, version: Version) -> Result<ModelRecord> {
        let (store, record) = self.registered(model_id, version)?;
        let dir = store.restore(&record).map_err(|e| RegistryError::Storage(e.to_string()))?;
        info!(model_id, %version, dir = %dir.display(), "version bundle checked");
        Ok(record)
    }

    fn registered(&self, model_id: &str, version: Version) -> Result<(&ArtifactStore, ModelRecord)> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| RegistryError::InvalidRequest("no artifact store is configured".into()))?;
        let snapshot = self.ledger.snapshot()?;
        match snapshot.get(model_id, version) {
            Some(r) => Ok((store, r.clone())),
            None if snapshot.latest(model_id).is_none() => Err(RegistryError::ModelNotFound { model_id: model_id.to_string() }),
            None => Err(RegistryError::VersionNotFound { model_id: model_id.to_string(), version }),
        }
    }

    pub async fn predict(&self, model_id: &str, requests: &[PredictionRequest]) -> Result<Prediction> {
        self.resolver.predict_batch(model_id, requests).await
    }

    pub async fn predict_version(&self, model_id: &str, version: Version, requests: &[PredictionRequest]) -> Result<Prediction> {
        self.resolver.predict_version(model_id, version, requests).await
    }
}

/// One allocate, stage, commit cycle. The bundle is published inside the ledger's
/// critical section, after the commit check passes and before the record becomes
/// visible, so a reader never sees a version without its bundle. A conflict or a
/// failed publish leaves the ledger untouched and drops the staged bundle.
fn register_once(ledger: &Ledger, store: Option<&ArtifactStore>, new: NewModel, attempt: usize) -> Result<ModelRecord> {
    let version = VersionAllocator::allocate(ledger, &new.model_id)?;
    let record = new.into_record(version);
    let mut staged = match store {
        Some(s) => Some(s.stage(&record).map_err(|e| RegistryError::Storage(e.to_string()))?),
        None => None,
    };
    let mut publish = |rec: &ModelRecord| -> Result<()> {
        if let Some(bundle) = staged.take() {
            bundle.publish().map_err(|e| {
                error!(model_id = %rec.model_id, version = %rec.version, error = %e, "version bundle not published; commit aborted");
                RegistryError::Storage(format!("bundle for '{}' {} could not be published: {e}", rec.model_id, rec.version))
            })?;
        }
        Ok(())
    };
    if let Err(e) = ledger.append_with(record.clone(), &mut publish) {
        if e.is_retryable() {
            METRICS.registration_conflicts_total.inc();
            warn!(model_id = %record.model_id, version = %record.version, attempt, "registration lost a version race");
        }
        return Err(e);
    }
    Ok(record)
}
