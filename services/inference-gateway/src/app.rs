//! Wiring a `ModelService` from configuration, one startup phase at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use model_registry::artifact::{LocalPathLocator, RemoteKeyLocator, RoutingLocator};
use model_registry::{ArtifactStore, FileLedger, Ledger, ModelService, ReferenceTable};
use tracing::info;

use crate::config::GatewayConfig;

pub fn open_ledger(cfg: &GatewayConfig) -> Result<Ledger> {
    let path = cfg.registry.ledger_path();
    let ledger = Ledger::new(FileLedger::open(&path, cfg.registry.ledger_options()).with_context(|| format!("opening ledger {}", path.display()))?);
    let snapshot = ledger.snapshot().context("reading ledger")?;
    info!(ledger = %ledger.describe(), revision = snapshot.revision, records = snapshot.records.len(), "registry ledger ready");
    Ok(ledger)
}

pub fn load_reference(cfg: &GatewayConfig) -> Result<ReferenceTable> {
    ReferenceTable::from_csv_file(&cfg.reference.path, &cfg.reference.join_key)
        .with_context(|| format!("loading reference data {}", cfg.reference.path.display()))
}

pub fn assemble(cfg: &GatewayConfig, ledger: Ledger, reference: ReferenceTable) -> Result<ModelService> {
    let remote = RemoteKeyLocator::new(cfg.registry.remote_base_url.clone(), cfg.registry.remote_timeout())?;
    let locator = RoutingLocator::new(LocalPathLocator::with_base(&cfg.registry.root), Some(Arc::new(remote)));
    let service = ModelService::builder(ledger, Arc::new(reference))
        .artifact_store(ArtifactStore::new(cfg.registry.models_root()))
        .pointer_mode(cfg.registry.pointer_mode)
        .locator(Arc::new(locator))
        .retry(cfg.retry.retry_config())
        .cache(cfg.cache.enabled)
        .build()?;
    info!(pointer_mode = ?cfg.registry.pointer_mode, cache = cfg.cache.enabled, remote = cfg.registry.remote_base_url.is_some(), "model service assembled");
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_from_an_empty_registry_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ref.csv"), "zipcode,income\n98052,81000\n").unwrap();
        let mut cfg = GatewayConfig::default();
        cfg.registry.root = dir.path().join("registry");
        cfg.reference.path = dir.path().join("ref.csv");
        let ledger = open_ledger(&cfg).unwrap();
        let reference = load_reference(&cfg).unwrap();
        assert_eq!(reference.len(), 1);
        let svc = assemble(&cfg, ledger, reference).unwrap();
        assert_eq!(svc.join_key(), "zipcode");
        assert!(svc.models().unwrap().is_empty());
    }

    #[test]
    fn missing_reference_file_fails_startup() {
        let mut cfg = GatewayConfig::default();
        cfg.reference.path = "/nonexistent/ref.csv".into();
        let err = load_reference(&cfg).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ref.csv"));
    }
}
