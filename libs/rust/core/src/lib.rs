//! Core shared utilities for valuation services.

use anyhow::Result;
use tracing::info;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use axum::{routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod lifecycle;
pub use lifecycle::{PhaseTiming, StartupPhase, StartupState};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
static STATUS: Lazy<RwLock<ServiceStatus>> = Lazy::new(|| RwLock::new(ServiceStatus::default()));

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ServiceStatus {
    pub service: Option<String>,
    pub started_at: Option<String>,
    pub phase: Option<StartupPhase>,
    /// Filled in once startup reaches `Serving`.
    pub startup: Vec<PhaseTiming>,
}

/// Record what `/status` reports. Last writer wins.
pub fn set_status(update: impl FnOnce(&mut ServiceStatus)) {
    let mut w = STATUS.write();
    update(&mut w);
}

pub fn status() -> ServiceStatus { STATUS.read().clone() }

/// Install the global subscriber once. `RUST_LOG` overrides `default_level`;
/// `VALUATION_JSON_LOG=1|true` switches to flattened JSON output.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("VALUATION_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok::<(), anyhow::Error>(())
    })?;
    set_status(|s| {
        s.service = Some(service.to_string());
        s.started_at = Some(chrono::Utc::now().to_rfc3339());
    });
    info!(target: "valuation", service, "tracing initialized");
    Ok(())
}

/// Layered configuration: struct defaults, then the optional file named by
/// `VALUATION_CONFIG_FILE`, then `VALUATION__SECTION__KEY` environment variables.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?;
    if let Ok(file) = std::env::var("VALUATION_CONFIG_FILE") {
        info!(file = %file, "loading config file");
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("VALUATION").prefix_separator("__").separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": true})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": is_ready()})) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "ready": is_ready(),
                "status": status(),
            }))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "Health server failed");
        }
    });
    Ok(())
}

/// Prometheus text exposition of the default registry.
pub fn render_metrics() -> Result<Vec<u8>> {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf)?;
    Ok(buf)
}

async fn metrics_handler() -> axum::response::Response {
    use axum::response::IntoResponse;
    match render_metrics() {
        Ok(buf) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        service_name: String,
        #[serde(default)]
        port: Option<u16>,
    }

    #[test]
    fn config_defaults_to_service_name() {
        let cfg: Sample = load_config("sample-svc").unwrap();
        assert_eq!(cfg.service_name, "sample-svc");
    }

    #[test]
    fn config_file_layer_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, "service_name: from-file\nport: 9000\n").unwrap();
        let built = config::Config::builder()
            .set_default("service_name", "default").unwrap()
            .add_source(config::File::from(path.as_path()))
            .build().unwrap();
        let cfg: Sample = built.try_deserialize().unwrap();
        assert_eq!(cfg.service_name, "from-file");
        assert_eq!(cfg.port, Some(9000));
    }

    #[test]
    fn readiness_flag_sets() {
        mark_ready();
        assert!(is_ready());
    }

    #[test]
    fn status_records_updates() {
        set_status(|s| s.service = Some("status-test".into()));
        assert_eq!(status().service.as_deref(), Some("status-test"));
    }
}
