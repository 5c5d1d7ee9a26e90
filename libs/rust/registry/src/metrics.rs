//! Registry and inference metrics, registered in the default prometheus registry
//! so the health server's `/metrics` route exposes them.

use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter, IntCounterVec};

pub struct RegistryMetrics {
    pub registrations_total: IntCounter,
    pub registration_conflicts_total: IntCounter,
    pub predictions_total: IntCounterVec,
    pub prediction_errors_total: IntCounterVec,
    pub predict_latency_ms: Histogram,
    pub artifact_cache_total: IntCounterVec,
}

pub static METRICS: Lazy<RegistryMetrics> = Lazy::new(|| RegistryMetrics {
    registrations_total: register_int_counter!("valuation_registrations_total", "Model versions registered")
        .expect("register registrations counter"),
    registration_conflicts_total: register_int_counter!("valuation_registration_conflicts_total", "Registration attempts that lost a version race")
        .expect("register conflict counter"),
    predictions_total: register_int_counter_vec!("valuation_predictions_total", "Prediction calls by outcome", &["outcome"])
        .expect("register predictions counter"),
    prediction_errors_total: register_int_counter_vec!("valuation_prediction_errors_total", "Failed predictions by error code", &["code"])
        .expect("register prediction error counter"),
    predict_latency_ms: register_histogram!(
        "valuation_predict_latency_ms",
        "End-to-end prediction latency ms",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    )
    .expect("register latency histogram"),
    artifact_cache_total: register_int_counter_vec!("valuation_artifact_cache_total", "Predictor cache lookups by result", &["result"])
        .expect("register cache counter"),
});

pub fn record_prediction(result: &crate::error::Result<impl Sized>, elapsed_ms: f64) {
    METRICS.predict_latency_ms.observe(elapsed_ms);
    match result {
        Ok(_) => METRICS.predictions_total.with_label_values(&["ok"]).inc(),
        Err(e) => {
            METRICS.predictions_total.with_label_values(&["error"]).inc();
            METRICS.prediction_errors_total.with_label_values(&[e.code()]).inc();
        }
    }
}
