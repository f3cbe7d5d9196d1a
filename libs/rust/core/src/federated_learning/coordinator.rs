//! Round coordinator: selection, local steps, FedAvg, privacy accounting and
//! publication, one round at a time.
//!
//! Rounds are serialized by an async mutex. The global model and privacy
//! ledger live behind one `RwLock` and are replaced together at commit, so a
//! reader sees either the pre-round or the post-round state. Dashboards read
//! the published [`RoundMetrics`] snapshot, which never takes that lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::aggregator::{Aggregator, FedAvg, NodeReport};
use super::trainer::{LocalTrainer, LocalUpdate, SimulatedTrainer};
use crate::config::CoordinatorConfig;
use crate::error::{FlError, FlResult};
use crate::metrics_ext::FL_METRICS;
use crate::persistence::{NodeRecord, PersistenceGateway, RoundRecord, TrainingMetrics};
use crate::privacy::{PrivacyAccountant, PrivacyLedger};
use crate::publisher::{MetricsPublisher, RoundMetrics, Subscription};
use crate::registry::{Node, NodeId, NodeRegistry, NodeStatus};

pub type RoundId = u64;

/// The global model is assumed to generalize slightly better than the mean
/// local model; `global_accuracy = mean(participant accuracy) + offset`.
pub const GLOBAL_ACCURACY_OFFSET: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    pub weights: Vec<f64>,
    pub round: RoundId,
}

struct ModelState {
    model: GlobalModel,
    privacy: PrivacyAccountant,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyView {
    #[serde(flatten)]
    pub ledger: PrivacyLedger,
    pub cumulative_epsilon: f64,
    pub total_budget: f64,
    pub remaining_budget: f64,
    pub delta: f64,
    /// Reference figure only; the budget above uses literal per-round accounting.
    pub advanced_composition_epsilon: f64,
}

pub struct CoordinatorBuilder {
    cfg: CoordinatorConfig,
    registry: Option<Arc<NodeRegistry>>,
    trainer: Option<Arc<dyn LocalTrainer>>,
    aggregator: Option<Arc<dyn Aggregator>>,
    persistence: Option<Arc<PersistenceGateway>>,
}

impl CoordinatorBuilder {
    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self { self.registry = Some(registry); self }
    pub fn trainer(mut self, trainer: Arc<dyn LocalTrainer>) -> Self { self.trainer = Some(trainer); self }
    pub fn aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self { self.aggregator = Some(aggregator); self }
    pub fn persistence(mut self, gateway: Arc<PersistenceGateway>) -> Self { self.persistence = Some(gateway); self }

    pub fn build(self) -> FlResult<RoundCoordinator> {
        let cfg = self.cfg;
        cfg.validate()?;
        // independent, reproducible streams per component when seeded
        let sub_seed = |k: u64| cfg.seed.map(|s| s.wrapping_add(k));
        let registry = self.registry.unwrap_or_else(|| Arc::new(NodeRegistry::new(sub_seed(1))));
        let trainer = self.trainer.unwrap_or_else(|| Arc::new(SimulatedTrainer::new(sub_seed(2)).with_dropout(cfg.simulated_dropout_rate)));
        let aggregator = self.aggregator.unwrap_or_else(|| Arc::new(FedAvg));
        let privacy = PrivacyAccountant::new(cfg.epsilon_per_round, sub_seed(3))?;
        let rng = match sub_seed(4) { Some(s) => StdRng::seed_from_u64(s), None => StdRng::from_entropy() };
        let publisher = Arc::new(MetricsPublisher::new(RoundMetrics::initial(cfg.total_privacy_budget), cfg.history_capacity));
        let model = GlobalModel { weights: vec![0.0; cfg.model_dimension], round: 0 };
        Ok(RoundCoordinator {
            registry,
            trainer,
            aggregator,
            persistence: self.persistence,
            publisher,
            state: RwLock::new(ModelState { model, privacy }),
            round_lock: tokio::sync::Mutex::new(()),
            rng: Mutex::new(rng),
            cfg,
        })
    }
}

pub struct RoundCoordinator {
    cfg: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    trainer: Arc<dyn LocalTrainer>,
    aggregator: Arc<dyn Aggregator>,
    persistence: Option<Arc<PersistenceGateway>>,
    publisher: Arc<MetricsPublisher>,
    state: RwLock<ModelState>,
    round_lock: tokio::sync::Mutex<()>,
    rng: Mutex<StdRng>,
}

/// Reports gathered in step 4 of a round, ordered by node id.
struct Collected {
    reports: Vec<NodeReport>,
    accuracies: Vec<(NodeId, f64)>,
}

impl RoundCoordinator {
    pub fn builder(cfg: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder { cfg, registry: None, trainer: None, aggregator: None, persistence: None }
    }

    /// Simulated trainer, FedAvg, no persistence.
    pub fn new(cfg: CoordinatorConfig) -> FlResult<Self> { Self::builder(cfg).build() }

    pub fn config(&self) -> &CoordinatorConfig { &self.cfg }
    pub fn registry(&self) -> &Arc<NodeRegistry> { &self.registry }
    pub fn publisher(&self) -> &Arc<MetricsPublisher> { &self.publisher }

    pub fn global_model(&self) -> GlobalModel { self.state.read().model.clone() }

    pub fn ledger(&self) -> PrivacyLedger { self.state.read().privacy.ledger() }

    pub fn privacy_view(&self) -> PrivacyView {
        let st = self.state.read();
        let ledger = st.privacy.ledger();
        PrivacyView {
            ledger,
            cumulative_epsilon: ledger.cumulative_epsilon(),
            total_budget: self.cfg.total_privacy_budget,
            remaining_budget: st.privacy.remaining_budget(self.cfg.total_privacy_budget),
            delta: self.cfg.delta,
            advanced_composition_epsilon: ledger.advanced_composition_epsilon(self.cfg.delta),
        }
    }

    /// Latest published snapshot. Before the first round, accuracies are
    /// derived from the registry so dashboards show the seeded population.
    pub fn current_metrics(&self) -> RoundMetrics {
        let latest = self.publisher.latest();
        if latest.round > 0 { return latest; }
        let mean = self.registry.mean_accuracy().unwrap_or(0.0);
        RoundMetrics { local_accuracy: mean, global_accuracy: mean, ..latest }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RoundMetrics) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.publisher.subscribe(callback)
    }

    /// One scheduled round over a random subset of the population.
    pub async fn run_round(&self) -> FlResult<RoundMetrics> { self.execute_round(None).await }

    /// Explicit trigger. A named node is registered first if unknown and is
    /// guaranteed to participate; inactive nodes are refused.
    pub async fn run_training_round(&self, node_id: Option<&str>) -> FlResult<RoundMetrics> { self.execute_round(node_id).await }

    #[instrument(skip(self), fields(round = tracing::field::Empty))]
    async fn execute_round(&self, forced: Option<&str>) -> FlResult<RoundMetrics> {
        let _serial = self.round_lock.lock().await;
        let started = Instant::now();
        let round = self.state.read().model.round + 1;
        tracing::Span::current().record("round", round);
        // checked under the round lock so a concurrent deactivation cannot slip in
        if let Some(id) = forced {
            let node = self.registry.upsert(id, None)?;
            if node.status == NodeStatus::Inactive {
                return Err(FlError::invalid(format!("node {id} is inactive")));
            }
        }

        let rate = {
            let mut rng = self.rng.lock();
            rng.gen_range(self.cfg.participation_rate_min..=self.cfg.participation_rate_max)
        };
        let mut selected: BTreeSet<NodeId> = self.registry.select_participants(rate)?;
        if let Some(id) = forced { selected.insert(id.to_string()); }
        if selected.is_empty() {
            debug!(round, "round_skipped_no_nodes");
            FL_METRICS.rounds_skipped_total.add(1, &[]);
            return Ok(self.current_metrics());
        }
        let participants: Vec<NodeId> = selected.into_iter().collect();
        self.registry.mark_training(&participants)?;
        info!(round, participants = participants.len(), rate, "round_started");

        let collected = self.collect_updates(round, &participants).await;
        if collected.reports.is_empty() {
            // nobody reported: nothing to aggregate, silent nodes stay Training
            warn!(round, selected = participants.len(), "round_skipped_no_reports");
            FL_METRICS.rounds_skipped_total.add(1, &[]);
            return Ok(self.current_metrics());
        }

        let remaining = match self.commit(round, &collected.reports) {
            Ok(remaining) => remaining,
            Err(e) => {
                if let Err(reset) = self.registry.mark_active(&participants) {
                    warn!(round, error = %reset, "participant_reset_failed");
                }
                FL_METRICS.rounds_failed_total.add(1, &[]);
                warn!(round, error = %e, "round_failed");
                return Err(FlError::RoundFailed { round, reason: e.to_string() });
            }
        };

        let reporters: Vec<NodeId> = collected.accuracies.iter().map(|(id, _)| id.clone()).collect();
        self.registry.record_accuracies(&collected.accuracies)?;
        self.registry.mark_active(&reporters)?;

        let mean = collected.accuracies.iter().map(|(_, a)| a).sum::<f64>() / collected.accuracies.len() as f64;
        let metrics = RoundMetrics {
            round,
            local_accuracy: mean,
            global_accuracy: (mean + GLOBAL_ACCURACY_OFFSET).min(1.0),
            participating_nodes: reporters.len(),
            privacy_budget_remaining: remaining,
            training_time_seconds: started.elapsed().as_secs_f64(),
        };
        FL_METRICS.rounds_total.add(1, &[]);
        FL_METRICS.participants_total.add(reporters.len() as u64, &[]);
        FL_METRICS.round_duration_ms.record(metrics.training_time_seconds * 1000.0, &[]);
        info!(round, method = ?self.aggregator.method(), participants = reporters.len(), global_accuracy = metrics.global_accuracy, budget_remaining = remaining, "round_completed");

        self.publisher.publish(metrics.clone());
        self.persist(round, &participants, &collected, &metrics).await;
        Ok(metrics)
    }

    /// Step 4: every participant trains concurrently. Failures and timeouts
    /// exclude that node for this round only.
    async fn collect_updates(&self, round: RoundId, participants: &[NodeId]) -> Collected {
        let global = self.state.read().model.weights.clone();
        let timeout = self.cfg.local_step_timeout();
        let steps = participants.iter().map(|id| {
            let global = &global;
            async move {
                let node = self.registry.get(id).map_err(anyhow::Error::from)?;
                if node.status == NodeStatus::Inactive { anyhow::bail!("node {id} was deactivated"); }
                let step = self.trainer.train(&node, global);
                let update = match timeout {
                    Some(limit) => tokio::time::timeout(limit, step).await.map_err(|_| anyhow::anyhow!("no report within {limit:?}"))??,
                    None => step.await?,
                };
                Ok::<(Node, LocalUpdate), anyhow::Error>((node, update))
            }
        });
        let results = join_all(steps).await;

        let mut collected = Collected { reports: Vec::new(), accuracies: Vec::new() };
        for (id, res) in participants.iter().zip(results) {
            match res {
                Ok((node, update)) => {
                    collected.accuracies.push((node.id.clone(), update.local_accuracy));
                    collected.reports.push(NodeReport { node_id: node.id, weights: update.weights, data_weight: node.data_weight });
                }
                Err(e) => {
                    FL_METRICS.rejected_updates_total.add(1, &[]);
                    warn!(round, node_id = %id, error = %e, "node_excluded");
                }
            }
        }
        collected
    }

    /// Steps 5–6 under the state lock. Nothing is written unless aggregation
    /// and privatization both succeed. Returns the remaining budget.
    fn commit(&self, round: RoundId, reports: &[NodeReport]) -> FlResult<f64> {
        let t0 = Instant::now();
        let mut st = self.state.write();
        let aggregated = self.aggregator.aggregate(&st.model.weights, reports)?;
        if aggregated.len() != st.model.weights.len() {
            return Err(FlError::invalid(format!("aggregator returned {} weights, model has {}", aggregated.len(), st.model.weights.len())));
        }
        let noisy = st.privacy.privatize(&aggregated, self.cfg.epsilon_per_round, self.cfg.sensitivity)?;
        st.model.weights = noisy;
        st.model.round = round;
        st.privacy.spend(self.cfg.epsilon_per_round);
        FL_METRICS.aggregation_latency_ms.record(t0.elapsed().as_secs_f64() * 1000.0, &[]);
        Ok(st.privacy.remaining_budget(self.cfg.total_privacy_budget))
    }

    /// Writes every selected node's registry state (silent ones included) and
    /// the round record listing the reporters.
    async fn persist(&self, round: RoundId, participants: &[NodeId], collected: &Collected, metrics: &RoundMetrics) {
        let Some(gateway) = &self.persistence else { return };
        let nodes: Vec<(NodeId, NodeRecord)> = participants
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|node| {
                let rec = NodeRecord {
                    status: node.status,
                    training_metrics: TrainingMetrics { round, local_accuracy: node.local_accuracy, data_weight: node.data_weight },
                    last_update_at: node.last_update,
                };
                (node.id, rec)
            })
            .collect();
        let record = RoundRecord {
            metrics: metrics.clone(),
            participants: collected.reports.iter().map(|r| r.node_id.clone()).collect(),
            completed_at: Utc::now(),
        };
        gateway.record_round_outcome(round, &nodes, &record).await;
    }

    pub async fn flush_persistence(&self) -> FlResult<()> {
        match &self.persistence {
            Some(gateway) => gateway.flush().await,
            None => Ok(()),
        }
    }
}
