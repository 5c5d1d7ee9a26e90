//! Registration races against independent handles on one ledger file, the way
//! separate worker processes would share it.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use model_registry::artifact::PredictorArtifact;
use model_registry::{
    ArtifactStore, AttributeMap, FileLedger, FileLedgerOptions, Ledger, ModelService, NewModel, PointerMode,
    PredictionRequest, ReferenceData, ReferenceTable, RetryConfig, Version, VersionAllocator,
};

const WRITERS: usize = 6;

fn handle(dir: &Path) -> Ledger {
    Ledger::new(FileLedger::open(dir.join("ledger.json"), FileLedgerOptions::default()).unwrap())
}

fn new_model() -> NewModel {
    NewModel {
        model_id: "home_price".into(),
        model_name: "Home price".into(),
        features: vec!["bedrooms".into(), "income".into()],
        author: "race".into(),
        artifact_pointer: "/artifacts/home_price.json".into(),
    }
}

fn service(dir: &Path, retry: RetryConfig) -> ModelService {
    ModelService::builder(handle(dir), Arc::new(ReferenceTable::new("zipcode"))).retry(retry).build().unwrap()
}

#[test]
fn simultaneous_first_registrations_cannot_both_be_v1() {
    let dir = tempfile::tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let outcomes: Vec<_> = (0..2)
        .map(|_| {
            let ledger = handle(dir.path());
            let barrier = barrier.clone();
            thread::spawn(move || {
                let version = VersionAllocator::allocate(&ledger, "home_price").unwrap();
                // both writers have read the same empty ledger before either commits
                barrier.wait();
                (version, ledger.append(new_model().into_record(version)))
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert!(outcomes.iter().all(|(v, _)| *v == Version::FIRST));
    let wins = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    let conflicts: Vec<_> = outcomes.iter().filter_map(|(_, r)| r.as_ref().err()).collect();
    assert_eq!(wins, 1);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].code(), "REGISTRATION_CONFLICT");
    assert_eq!(handle(dir.path()).versions("home_price").unwrap(), vec![Version::FIRST]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_retries_losers_see_a_conflict_and_no_version_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let services: Vec<_> = (0..WRITERS).map(|_| Arc::new(service(dir.path(), RetryConfig::none()))).collect();
    let barrier = Arc::new(tokio::sync::Barrier::new(WRITERS));
    let tasks: Vec<_> = services
        .into_iter()
        .map(|svc| {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                svc.register(new_model()).await
            })
        })
        .collect();

    let mut won = Vec::new();
    for t in tasks {
        match t.await.unwrap() {
            Ok(rec) => won.push(rec.version),
            Err(e) => assert_eq!(e.code(), "REGISTRATION_CONFLICT"),
        }
    }
    let distinct: BTreeSet<_> = won.iter().copied().collect();
    assert!(!won.is_empty());
    assert_eq!(distinct.len(), won.len(), "a version was handed out twice: {won:?}");
    assert_eq!(handle(dir.path()).versions("home_price").unwrap(), distinct.into_iter().collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn with_retries_every_writer_gets_a_distinct_version() {
    let dir = tempfile::tempdir().unwrap();
    let retry = RetryConfig {
        max_retries: WRITERS * 4,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
        jitter: 0.5,
    };
    let tasks: Vec<_> = (0..WRITERS)
        .map(|_| {
            let svc = service(dir.path(), retry.clone());
            tokio::spawn(async move { svc.register(new_model()).await })
        })
        .collect();

    let mut versions = Vec::new();
    for t in tasks {
        versions.push(t.await.unwrap().unwrap().version.get());
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=WRITERS as u32).collect::<Vec<_>>());
    assert_eq!(handle(dir.path()).snapshot().unwrap().revision, WRITERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_version_before_its_bundle() {
    const READERS: usize = 3;
    const REGISTRATIONS: usize = 60;

    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("home_price.json");
    std::fs::write(&artifact, serde_json::to_vec(&PredictorArtifact::linear(vec![1.0, 0.0], 0.0)).unwrap()).unwrap();
    let mut table = ReferenceTable::new("zipcode");
    table.insert("98052", AttributeMap::from([("income".to_string(), 81000.0.into())]));
    let reference: Arc<dyn ReferenceData> = Arc::new(table);
    let pointer_file_service = || {
        ModelService::builder(handle(dir.path()), reference.clone())
            .artifact_store(ArtifactStore::new(dir.path().join("models")))
            .pointer_mode(PointerMode::PointerFile)
            .cache(false)
            .retry(RetryConfig::none())
            .build()
            .unwrap()
    };
    let new = NewModel { artifact_pointer: artifact.display().to_string(), ..new_model() };

    let writer = pointer_file_service();
    writer.register(new.clone()).await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let svc = pointer_file_service();
            let done = done.clone();
            tokio::spawn(async move {
                let row = PredictionRequest::new("zipcode", "98052", AttributeMap::from([("bedrooms".to_string(), 3.0.into())]));
                let (mut served, mut failures) = (0usize, Vec::new());
                while !done.load(Ordering::Relaxed) {
                    match svc.predict("home_price", &[row.clone()]).await {
                        Ok(p) => {
                            assert_eq!(p.predictions, vec![3.0]);
                            served += 1;
                        }
                        Err(e) => failures.push(format!("{}: {e}", e.code())),
                    }
                    tokio::task::yield_now().await;
                }
                (served, failures)
            })
        })
        .collect();

    for _ in 1..REGISTRATIONS {
        writer.register(new.clone()).await.unwrap();
    }
    done.store(true, Ordering::Relaxed);

    let mut served = 0;
    for r in readers {
        let (n, failures) = r.await.unwrap();
        assert!(failures.is_empty(), "readers observed failures: {failures:?}");
        served += n;
    }
    assert!(served > 0);
    assert_eq!(writer.latest("home_price").unwrap().version, Version::new(REGISTRATIONS as u32));
}
