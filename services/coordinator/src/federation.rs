use std::sync::Arc;

use anyhow::Result;
use fedlearn_core::{
    CoordinatorConfig, FlResult, Node, PersistenceGateway, PrivacyView, RoundCoordinator, RoundMetrics, RoundScheduler,
};
use tracing::{info, warn};

/// Everything the HTTP boundary talks to: one coordinator plus the periodic
/// driver behind start/stop.
pub struct FederationModule {
    coordinator: Arc<RoundCoordinator>,
    scheduler: RoundScheduler,
}

impl FederationModule {
    pub fn new(cfg: CoordinatorConfig, persistence: Option<Arc<PersistenceGateway>>) -> Result<Self> {
        let mut builder = RoundCoordinator::builder(cfg);
        if let Some(gateway) = persistence {
            builder = builder.persistence(gateway);
        }
        let coordinator = Arc::new(builder.build()?);
        let scheduler = RoundScheduler::new(coordinator.clone(), coordinator.config().round_interval());
        info!(dimension = coordinator.config().model_dimension, "federation_module_initialized");
        Ok(Self { coordinator, scheduler })
    }

    /// Registers `node-001..node-{count}` with default accuracy and weight.
    pub fn seed_nodes(&self, count: usize) -> FlResult<()> {
        for i in 1..=count {
            self.coordinator.registry().upsert(&format!("node-{i:03}"), None)?;
        }
        info!(count, total = self.coordinator.registry().len(), "initial_nodes_registered");
        Ok(())
    }

    pub fn coordinator(&self) -> &Arc<RoundCoordinator> { &self.coordinator }

    pub fn start_simulation(&self) -> bool {
        self.scheduler.start();
        self.scheduler.is_running()
    }

    pub async fn stop_simulation(&self) -> bool {
        self.scheduler.stop().await;
        self.scheduler.is_running()
    }

    pub fn is_running(&self) -> bool { self.scheduler.is_running() }

    pub async fn run_training_round(&self, node_id: Option<&str>) -> FlResult<RoundMetrics> {
        self.coordinator.run_training_round(node_id).await
    }

    pub fn current_metrics(&self) -> RoundMetrics { self.coordinator.current_metrics() }

    pub fn history(&self) -> Vec<RoundMetrics> { self.coordinator.publisher().history() }

    pub fn nodes(&self) -> Vec<Node> { self.coordinator.registry().snapshot() }

    pub fn privacy(&self) -> PrivacyView { self.coordinator.privacy_view() }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await;
        if let Err(e) = self.coordinator.flush_persistence().await {
            warn!(error = %e, "persistence_flush_failed");
        }
        info!("federation_module_shutdown");
        Ok(())
    }
}
