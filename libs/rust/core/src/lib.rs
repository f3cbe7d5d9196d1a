//! Core of the federated-learning training coordinator: node registry,
//! privacy accountant, FedAvg aggregation, round coordination, metrics
//! publication, and the shared service bootstrap (tracing, metrics, health).

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use once_cell::sync::OnceCell;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod error;
pub mod federated_learning;
pub mod metrics_ext;
pub mod persistence;
pub mod privacy;
pub mod publisher;
pub mod registry;
pub mod resilience;
pub mod scheduler;

pub use config::{load_config, CoordinatorConfig, ServiceConfig, StoreConfig};
pub use error::{FlError, FlResult};
pub use federated_learning::{
    federated_average, AggregationMethod, Aggregator, FedAvg, GlobalModel, LocalTrainer, LocalUpdate, NodeReport,
    PrivacyView, RoundCoordinator, RoundId, SimulatedTrainer, GLOBAL_ACCURACY_OFFSET,
};
pub use metrics_ext::{FederatedLearningMetrics, FL_METRICS};
pub use persistence::{MemoryStore, NodeRecord, PersistenceGateway, PersistenceStore, RoundRecord, SledStore};
pub use privacy::{PrivacyAccountant, PrivacyLedger};
pub use publisher::{MetricsPublisher, RoundMetrics, Subscription};
pub use registry::{Node, NodeId, NodeRegistry, NodeStatus, MAX_LOCAL_ACCURACY};
pub use scheduler::RoundScheduler;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static PROM_REGISTRY: OnceCell<prometheus::Registry> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `FEDLEARN_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let json = std::env::var("FEDLEARN_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true)).try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(target: "fedlearn", service, "tracing initialized");
    Ok(())
}

/// Routes OpenTelemetry instruments to a Prometheus registry served at `/metrics`.
pub fn init_metrics() -> Result<()> {
    PROM_REGISTRY.get_or_try_init(|| -> Result<prometheus::Registry> {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter().with_registry(registry.clone()).build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider);
        Ok(registry)
    })?;
    Ok(())
}

/// `/live`, `/ready`, `/status` and `/metrics`; services merge their own routes on top.
pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({ "live": true })) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({ "ready": NODE_READINESS.load(Ordering::SeqCst) })) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "live": true,
                "ready": NODE_READINESS.load(Ordering::SeqCst),
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn serve(router: Router, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    let Some(registry) = PROM_REGISTRY.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    };
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}
