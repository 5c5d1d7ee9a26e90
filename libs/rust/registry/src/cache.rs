//! Read-through cache of loaded predictors keyed by `(model_id, version)`.
//!
//! A version's artifact is immutable once registered, so entries never go stale
//! on their own; older versions are evicted when a newer one is registered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::artifact::Predictor;
use crate::metrics::METRICS;
use crate::record::Version;

type Key = (String, Version);

pub struct PredictorCache {
    enabled: bool,
    entries: RwLock<HashMap<Key, Arc<dyn Predictor>>>,
}

impl PredictorCache {
    pub fn new(enabled: bool) -> Self { Self { enabled, entries: RwLock::new(HashMap::new()) } }
    pub fn disabled() -> Self { Self::new(false) }

    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }

    pub fn get(&self, model_id: &str, version: Version) -> Option<Arc<dyn Predictor>> {
        if !self.enabled { return None; }
        self.entries.read().get(&(model_id.to_string(), version)).cloned()
    }

    /// Return the cached predictor or run `load` and remember its result. Concurrent
    /// misses may both load; the last insert wins and both results are equivalent.
    pub async fn get_or_load<F, Fut, E>(&self, model_id: &str, version: Version, load: F) -> Result<Arc<dyn Predictor>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Predictor>, E>>,
    {
        if let Some(hit) = self.get(model_id, version) {
            METRICS.artifact_cache_total.with_label_values(&["hit"]).inc();
            return Ok(hit);
        }
        METRICS.artifact_cache_total.with_label_values(&["miss"]).inc();
        let predictor = load().await?;
        if self.enabled {
            self.entries.write().insert((model_id.to_string(), version), predictor.clone());
        }
        Ok(predictor)
    }

    /// Drop every cached version of `model_id` below `keep`.
    pub fn evict_older(&self, model_id: &str, keep: Version) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(id, v), _| id != model_id || *v >= keep);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(model_id, %keep, evicted, "evicted cached predictors");
        }
    }

    /// Forget one version, e.g. after its pointer was moved.
    pub fn evict(&self, model_id: &str, version: Version) {
        if self.entries.write().remove(&(model_id.to_string(), version)).is_some() {
            debug!(model_id, %version, "evicted cached predictor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PredictorArtifact;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn predictor() -> Arc<dyn Predictor> { Arc::new(PredictorArtifact::linear(vec![1.0], 0.0)) }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let cache = PredictorCache::new(true);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_load("m", Version::new(1), || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(predictor())
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_cache_always_loads() {
        let cache = PredictorCache::disabled();
        let loads = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_load("m", Version::new(1), || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(predictor())
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let cache = PredictorCache::new(true);
        let err = cache.get_or_load("m", Version::new(1), || async { Err::<Arc<dyn Predictor>, _>("boom") }).await;
        assert!(err.is_err());
        assert!(cache.get("m", Version::new(1)).is_none());
    }

    #[tokio::test]
    async fn eviction_keeps_newer_and_other_models() {
        let cache = PredictorCache::new(true);
        for (id, v) in [("m", 1), ("m", 2), ("other", 1)] {
            cache.get_or_load(id, Version::new(v), || async { Ok::<_, ()>(predictor()) }).await.unwrap();
        }
        cache.evict_older("m", Version::new(2));
        assert!(cache.get("m", Version::new(1)).is_none());
        assert!(cache.get("m", Version::new(2)).is_some());
        assert!(cache.get("other", Version::new(1)).is_some());

        cache.evict("other", Version::new(1));
        assert!(cache.get("other", Version::new(1)).is_none());
        assert_eq!(cache.len(), 1);
    }
}
