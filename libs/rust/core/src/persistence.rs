//! Persistence collaborator. The coordinator records node state and per-round
//! results through [`PersistenceGateway`], which never fails a round: errors
//! are retried, then logged and counted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{FlError, FlResult};
use crate::metrics_ext::FL_METRICS;
use crate::publisher::RoundMetrics;
use crate::registry::{NodeId, NodeStatus};
use crate::resilience::{retry_async, CircuitBreaker, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    pub round: u64,
    pub local_accuracy: f64,
    pub data_weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    pub training_metrics: TrainingMetrics,
    pub last_update_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub metrics: RoundMetrics,
    pub participants: Vec<NodeId>,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn record_node(&self, node_id: &str, record: &NodeRecord) -> FlResult<()>;
    async fn record_round(&self, round: u64, record: &RoundRecord) -> FlResult<()>;
    async fn flush(&self) -> FlResult<()>;
}

/// Embedded sled database; keys `node:{id}` and `round:{n:020}`, JSON values.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> FlResult<Self> {
        let db = sled::open(path).map_err(unavailable)?;
        Ok(Self { db })
    }

    pub fn temporary() -> FlResult<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(unavailable)?;
        Ok(Self { db })
    }

    pub fn node(&self, node_id: &str) -> FlResult<Option<NodeRecord>> { self.read(&node_key(node_id)) }

    pub fn round(&self, round: u64) -> FlResult<Option<RoundRecord>> { self.read(&round_key(round)) }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> FlResult<Option<T>> {
        match self.db.get(key).map_err(unavailable)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| FlError::PersistenceUnavailable(format!("corrupt record {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: String, value: &T) -> FlResult<()> {
        let json = serde_json::to_vec(value).map_err(|e| FlError::PersistenceUnavailable(e.to_string()))?;
        self.db.insert(key.as_bytes(), json).map_err(unavailable)?;
        Ok(())
    }
}

fn node_key(id: &str) -> String { format!("node:{id}") }
fn round_key(round: u64) -> String { format!("round:{round:020}") }
fn unavailable(e: sled::Error) -> FlError { FlError::PersistenceUnavailable(e.to_string()) }

#[async_trait]
impl PersistenceStore for SledStore {
    async fn record_node(&self, node_id: &str, record: &NodeRecord) -> FlResult<()> { self.write(node_key(node_id), record) }

    async fn record_round(&self, round: u64, record: &RoundRecord) -> FlResult<()> { self.write(round_key(round), record) }

    async fn flush(&self) -> FlResult<()> {
        self.db.flush_async().await.map_err(unavailable)?;
        Ok(())
    }
}

/// In-process store; `set_failing(true)` makes every call fail.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    rounds: RwLock<BTreeMap<u64, RoundRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }

    pub fn node(&self, id: &str) -> Option<NodeRecord> { self.nodes.read().get(id).cloned() }

    pub fn round(&self, round: u64) -> Option<RoundRecord> { self.rounds.read().get(&round).cloned() }

    pub fn round_count(&self) -> usize { self.rounds.read().len() }

    fn check(&self) -> FlResult<()> {
        if self.failing.load(Ordering::SeqCst) { Err(FlError::PersistenceUnavailable("memory store offline".into())) } else { Ok(()) }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn record_node(&self, node_id: &str, record: &NodeRecord) -> FlResult<()> {
        self.check()?;
        self.nodes.write().insert(node_id.to_string(), record.clone());
        Ok(())
    }

    async fn record_round(&self, round: u64, record: &RoundRecord) -> FlResult<()> {
        self.check()?;
        self.rounds.write().insert(round, record.clone());
        Ok(())
    }

    async fn flush(&self) -> FlResult<()> { self.check() }
}

/// Best-effort front for a [`PersistenceStore`].
pub struct PersistenceGateway {
    store: Arc<dyn PersistenceStore>,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn PersistenceStore>, cfg: &StoreConfig) -> Self {
        let retry = RetryConfig { max_retries: cfg.max_retries, base_delay: Duration::from_millis(cfg.retry_base_delay_ms), ..RetryConfig::default() };
        Self { store, retry, breaker: CircuitBreaker::new(cfg.breaker_failure_threshold, Duration::from_secs(cfg.breaker_open_secs)) }
    }

    /// Builds the store named by `cfg`: sled when a path is set, memory otherwise.
    pub fn from_config(cfg: &StoreConfig) -> FlResult<Self> {
        let store: Arc<dyn PersistenceStore> = match &cfg.path {
            Some(path) => Arc::new(SledStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(store, cfg))
    }

    /// Writes every node record then the round record. Returns the number of
    /// failed writes; failures are logged, never propagated.
    pub async fn record_round_outcome(&self, round: u64, nodes: &[(NodeId, NodeRecord)], record: &RoundRecord) -> usize {
        let mut failures = 0;
        for (id, rec) in nodes {
            if let Err(e) = self.guarded(|| self.store.record_node(id, rec)).await {
                warn!(round, node_id = %id, error = %e, "persistence_write_failed");
                failures += 1;
            }
        }
        if let Err(e) = self.guarded(|| self.store.record_round(round, record)).await {
            warn!(round, error = %e, "persistence_write_failed");
            failures += 1;
        }
        if failures > 0 { FL_METRICS.persistence_failures_total.add(failures as u64, &[]); }
        failures
    }

    pub async fn flush(&self) -> FlResult<()> { self.guarded(|| self.store.flush()).await }

    async fn guarded<F, Fut>(&self, mut op: F) -> FlResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = FlResult<()>>,
    {
        if !self.breaker.allow() {
            debug!("persistence_skipped_breaker_open");
            return Err(FlError::PersistenceUnavailable("circuit open".into()));
        }
        let res = retry_async(&self.retry, |_| op()).await;
        match &res {
            Ok(()) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        res
    }
}
