use std::sync::Arc;

use anyhow::Result;
use fedlearn_core::{clear_ready, health_router, init_metrics, init_tracing, load_config, mark_ready, serve, PersistenceGateway};
use tracing::{error, info};

mod api;
mod federation;

use federation::FederationModule;

const SERVICE: &str = "coordinator";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config(SERVICE)?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    init_metrics()?;
    info!(target: "coordinator", port = cfg.http_port, store = ?cfg.store.path, "Starting coordinator service");

    let gateway = Arc::new(PersistenceGateway::from_config(&cfg.store)?);
    let fed = Arc::new(FederationModule::new(cfg.coordinator.clone(), Some(gateway))?);
    fed.seed_nodes(cfg.coordinator.initial_nodes)?;

    let app = health_router().merge(api::router(fed.clone()));
    let port = cfg.http_port;
    let server = tokio::spawn(async move {
        if let Err(e) = serve(app, port).await {
            error!(error = ?e, "http_server_failed");
        }
    });
    mark_ready();

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    clear_ready();
    fed.shutdown().await?;
    server.abort();
    Ok(())
}
