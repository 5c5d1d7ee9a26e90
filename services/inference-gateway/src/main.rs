use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use valuation_core::{clear_ready, init_tracing, load_config, start_health_server, StartupState};

mod app;
mod config;
mod routes;

use config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let mut startup = StartupState::new();
    let cfg: GatewayConfig = load_config("inference-gateway")?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(?cfg, "config loaded");
    start_health_server(cfg.health_port).await?;

    startup.advance();
    let ledger = app::open_ledger(&cfg)?;

    startup.advance();
    let reference = app::load_reference(&cfg)?;
    info!(rows = reference.len(), join_key = %cfg.reference.join_key, "reference data ready");
    let service = Arc::new(app::assemble(&cfg, ledger, reference)?);

    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    startup.advance();
    info!(addr = %cfg.listen_addr, "inference gateway listening");

    axum::serve(listener, routes::router(service)).with_graceful_shutdown(shutdown_signal()).await?;
    clear_ready();
    info!("shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
