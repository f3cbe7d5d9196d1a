//! Layered service configuration: struct defaults, optional file, `FEDLEARN__*` env.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FlError, FlResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_name: String,
    pub log_level: String,
    pub http_port: u16,
    pub coordinator: CoordinatorConfig,
    pub store: StoreConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "coordinator-service".into(),
            log_level: "info".into(),
            http_port: 8090,
            coordinator: CoordinatorConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Round, privacy and population parameters of one coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Length of the global weight vector; fixed for the coordinator's lifetime.
    pub model_dimension: usize,
    pub epsilon_per_round: f64,
    pub total_privacy_budget: f64,
    pub sensitivity: f64,
    pub delta: f64,
    pub participation_rate_min: f64,
    pub participation_rate_max: f64,
    pub round_interval_secs: u64,
    pub local_step_timeout_ms: Option<u64>,
    pub seed: Option<u64>,
    pub initial_nodes: usize,
    pub history_capacity: usize,
    pub simulated_dropout_rate: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            model_dimension: 10,
            epsilon_per_round: 1.0,
            total_privacy_budget: 10.0,
            sensitivity: 0.01,
            delta: 1e-5,
            participation_rate_min: 0.30,
            participation_rate_max: 0.70,
            round_interval_secs: 10,
            local_step_timeout_ms: None,
            seed: None,
            initial_nodes: 10,
            history_capacity: 100,
            simulated_dropout_rate: 0.0,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> FlResult<()> {
        if self.model_dimension == 0 { return Err(FlError::invalid("model_dimension must be > 0")); }
        if !(self.epsilon_per_round > 0.0 && self.epsilon_per_round.is_finite()) {
            return Err(FlError::invalid(format!("epsilon_per_round must be positive, got {}", self.epsilon_per_round)));
        }
        if !(self.sensitivity > 0.0 && self.sensitivity.is_finite()) {
            return Err(FlError::invalid(format!("sensitivity must be positive, got {}", self.sensitivity)));
        }
        if !(self.total_privacy_budget > 0.0) {
            return Err(FlError::invalid("total_privacy_budget must be positive"));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(FlError::invalid("delta must lie in (0, 1)"));
        }
        let (lo, hi) = (self.participation_rate_min, self.participation_rate_max);
        if !(lo > 0.0 && hi <= 1.0 && lo <= hi) {
            return Err(FlError::invalid(format!("participation rate bounds must satisfy 0 < min <= max <= 1, got [{lo}, {hi}]")));
        }
        if !(0.0..1.0).contains(&self.simulated_dropout_rate) {
            return Err(FlError::invalid("simulated_dropout_rate must lie in [0, 1)"));
        }
        if self.round_interval_secs == 0 { return Err(FlError::invalid("round_interval_secs must be > 0")); }
        Ok(())
    }

    pub fn round_interval(&self) -> Duration { Duration::from_secs(self.round_interval_secs) }

    pub fn local_step_timeout(&self) -> Option<Duration> { self.local_step_timeout_ms.map(Duration::from_millis) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sled directory; in-memory store when unset.
    pub path: Option<String>,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_open_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: None, max_retries: 2, retry_base_delay_ms: 25, breaker_failure_threshold: 5, breaker_open_secs: 30 }
    }
}

pub fn load_config(service: &str) -> Result<ServiceConfig> {
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    if let Ok(file) = std::env::var("FEDLEARN_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDLEARN").separator("__").try_parsing(true));
    let cfg: ServiceConfig = builder.build()?.try_deserialize()?;
    cfg.coordinator.validate()?;
    Ok(cfg)
}
