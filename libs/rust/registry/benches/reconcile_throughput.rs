use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use model_registry::{AttributeMap, AttributeValue, FeatureReconciler, PredictionRequest, ReferenceTable};

const FEATURES: [&str; 12] = [
    "bedrooms", "bathrooms", "sqft_living", "sqft_lot", "floors", "sqft_above", "sqft_basement",
    "ppltn_qty", "medn_hshld_incm_amt", "medn_incm_per_prsn_amt", "hous_val_amt", "edctn_bchlr_qty",
];

fn reconciler() -> FeatureReconciler {
    let mut table = ReferenceTable::new("zipcode");
    for zip in 98001..98200u32 {
        let attrs: AttributeMap = FEATURES[7..].iter().map(|f| (f.to_string(), AttributeValue::Number(zip as f64))).collect();
        table.insert(zip.to_string(), attrs);
    }
    FeatureReconciler::new(Arc::new(table))
}

fn request(zip: u32) -> PredictionRequest {
    let attrs: AttributeMap = FEATURES[..7].iter().enumerate().map(|(i, f)| (f.to_string(), AttributeValue::Number(i as f64))).collect();
    PredictionRequest::new("zipcode", zip.to_string(), attrs)
}

fn bench_reconcile(c: &mut Criterion) {
    let r = reconciler();
    let features: Vec<String> = FEATURES.iter().map(|s| s.to_string()).collect();

    c.bench_function("reconcile_single_12_features", |b| {
        let req = request(98052);
        b.iter(|| { let _ = r.reconcile(&req, &features); })
    });

    c.bench_function("reconcile_batch_100", |b| {
        b.iter_batched(
            || (0..100).map(|i| request(98001 + i)).collect::<Vec<_>>(),
            |rows| { let _ = r.reconcile_batch(&rows, &features); },
            BatchSize::SmallInput
        )
    });
}

criterion_group!(name=reconcile; config=Criterion::default(); targets=bench_reconcile);
criterion_main!(reconcile);
