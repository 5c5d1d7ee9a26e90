//! End-to-end prediction: ledger lookup, artifact resolution, reconciliation,
//! invocation. Never mutates the ledger or the reference data.

use std::slice;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::artifact::{ArtifactError, ArtifactLoader, ArtifactLocator, ArtifactStore, PointerResolver, Predictor};
use crate::cache::PredictorCache;
use crate::error::{InvocationFailure, RegistryError, Result};
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::metrics;
use crate::reconcile::{FeatureReconciler, PredictionRequest};
use crate::record::{ModelRecord, Version};

/// Raw predictor output, one value per request row, unrounded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub model_id: String,
    pub version: Version,
    pub predictions: Vec<f64>,
}

pub struct InferenceResolver {
    ledger: Ledger,
    pointers: Arc<dyn PointerResolver>,
    locator: Arc<dyn ArtifactLocator>,
    loader: Arc<dyn ArtifactLoader>,
    reconciler: FeatureReconciler,
    manifests: Option<ArtifactStore>,
    cache: Arc<PredictorCache>,
}

impl InferenceResolver {
    pub fn new(
        ledger: Ledger,
        pointers: Arc<dyn PointerResolver>,
        locator: Arc<dyn ArtifactLocator>,
        loader: Arc<dyn ArtifactLoader>,
        reconciler: FeatureReconciler,
    ) -> Self {
        Self { ledger, pointers, locator, loader, reconciler, manifests: None, cache: Arc::new(PredictorCache::disabled()) }
    }

    /// Check each version's `model_features.json` against the ledger before loading.
    pub fn with_manifest_check(mut self, store: ArtifactStore) -> Self {
        self.manifests = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<PredictorCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn reconciler(&self) -> &FeatureReconciler { &self.reconciler }

    /// Predict one request against the latest version of `model_id`.
    pub async fn predict(&self, model_id: &str, request: &PredictionRequest) -> Result<Prediction> {
        self.predict_batch(model_id, slice::from_ref(request)).await
    }

    /// Predict every row against the latest version; the predictor is invoked once.
    #[instrument(skip(self, requests), fields(rows = requests.len()))]
    pub async fn predict_batch(&self, model_id: &str, requests: &[PredictionRequest]) -> Result<Prediction> {
        let started = Instant::now();
        let result = async {
            let snapshot = self.snapshot().await?;
            let record = snapshot.latest(model_id).ok_or_else(|| RegistryError::ModelNotFound { model_id: model_id.to_string() })?;
            self.run(record, requests).await
        }
        .await;
        metrics::record_prediction(&result, started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Predict against an exact version instead of the latest.
    #[instrument(skip(self, requests), fields(rows = requests.len()))]
    pub async fn predict_version(&self, model_id: &str, version: Version, requests: &[PredictionRequest]) -> Result<Prediction> {
        let started = Instant::now();
        let result = async {
            let snapshot = self.snapshot().await?;
            let record = match snapshot.get(model_id, version) {
                Some(r) => r,
                None if snapshot.latest(model_id).is_none() => return Err(RegistryError::ModelNotFound { model_id: model_id.to_string() }),
                None => return Err(RegistryError::VersionNotFound { model_id: model_id.to_string(), version }),
            };
            self.run(record, requests).await
        }
        .await;
        metrics::record_prediction(&result, started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// The file ledger is read with blocking IO, so it is read off the async workers.
    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || ledger.snapshot())
            .await
            .map_err(|e| RegistryError::Storage(format!("ledger read task failed: {e}")))?
    }

    async fn run(&self, record: &ModelRecord, requests: &[PredictionRequest]) -> Result<Prediction> {
        if requests.is_empty() {
            return Err(RegistryError::InvalidRequest("at least one prediction row is required".into()));
        }
        let predictor = self.load(record).await?;
        let rows: Vec<Vec<f64>> =
            self.reconciler.reconcile_batch(requests, &record.features)?.into_iter().map(|v| v.into_values()).collect();
        let invocation = |source| RegistryError::Invocation { model_id: record.model_id.clone(), version: record.version, source };
        let outputs = predictor.predict(&rows).map_err(invocation)?;
        if outputs.len() != rows.len() {
            return Err(invocation(InvocationFailure::OutputCount { expected: rows.len(), got: outputs.len() }));
        }
        debug!(model_id = %record.model_id, version = %record.version, rows = rows.len(), "prediction served");
        Ok(Prediction { model_id: record.model_id.clone(), version: record.version, predictions: outputs })
    }

    async fn load(&self, record: &ModelRecord) -> Result<Arc<dyn Predictor>> {
        self.cache
            .get_or_load(&record.model_id, record.version, || self.fetch_predictor(record))
            .await
            .map_err(|e| {
                warn!(model_id = %record.model_id, version = %record.version, error = %e, "artifact load failed");
                RegistryError::ArtifactLoad { model_id: record.model_id.clone(), version: record.version, reason: e.to_string() }
            })
    }

    async fn fetch_predictor(&self, record: &ModelRecord) -> std::result::Result<Arc<dyn Predictor>, ArtifactError> {
        let (pointers, manifests, rec) = (self.pointers.clone(), self.manifests.clone(), record.clone());
        let location = tokio::task::spawn_blocking(move || {
            if let Some(store) = &manifests {
                store.verify_manifest(&rec)?;
            }
            pointers.locate(&rec)
        })
        .await
        .map_err(|e| ArtifactError::Task(e.to_string()))??;
        debug!(model_id = %record.model_id, version = %record.version, %location, "resolving artifact");
        let bytes = self.locator.resolve(&location).await?;
        let predictor = self.loader.load(&bytes)?;
        if predictor.n_features() != record.features.len() {
            return Err(ArtifactError::Decode(format!(
                "predictor expects {} features but the model declares {}",
                predictor.n_features(),
                record.features.len()
            )));
        }
        Ok(predictor)
    }
}
