use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedlearn_core::{
    AggregationMethod, Aggregator, CoordinatorConfig, FlError, FlResult, LocalTrainer, LocalUpdate, MemoryStore, Node,
    NodeReport, NodeStatus, PersistenceGateway, RoundCoordinator, RoundScheduler, StoreConfig, GLOBAL_ACCURACY_OFFSET,
    MAX_LOCAL_ACCURACY,
};
use futures::future::join_all;
use tokio::sync::Notify;

fn full_participation(seed: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        seed: Some(seed),
        model_dimension: 4,
        participation_rate_min: 1.0,
        participation_rate_max: 1.0,
        ..Default::default()
    }
}

/// Noise small enough to be invisible next to the updates.
fn near_noiseless(seed: u64) -> CoordinatorConfig {
    CoordinatorConfig { epsilon_per_round: 1e9, sensitivity: 1e-9, ..full_participation(seed) }
}

fn register_three(coord: &RoundCoordinator) {
    for (id, w) in [("a", 100), ("b", 100), ("c", 200)] {
        coord.registry().register(Node::new(id, 0.80, w).unwrap()).unwrap();
    }
}

/// Keeps accuracy, reports `data_weight` on every coordinate.
struct WeightEcho;

#[async_trait]
impl LocalTrainer for WeightEcho {
    async fn train(&self, node: &Node, global: &[f64]) -> anyhow::Result<LocalUpdate> {
        Ok(LocalUpdate { local_accuracy: node.local_accuracy, weights: vec![node.data_weight as f64; global.len()] })
    }
}

struct FailsFor(&'static str);

#[async_trait]
impl LocalTrainer for FailsFor {
    async fn train(&self, node: &Node, global: &[f64]) -> anyhow::Result<LocalUpdate> {
        if node.id == self.0 { anyhow::bail!("connection reset"); }
        Ok(LocalUpdate { local_accuracy: node.local_accuracy, weights: vec![0.0; global.len()] })
    }
}

struct BrokenAggregator;

impl Aggregator for BrokenAggregator {
    fn method(&self) -> AggregationMethod { AggregationMethod::FedAvg }
    fn aggregate(&self, _global: &[f64], _reports: &[NodeReport]) -> FlResult<Vec<f64>> {
        Err(FlError::invalid("aggregation diverged"))
    }
}

struct SlowTrainer {
    started: Arc<Notify>,
    delay: Duration,
}

#[async_trait]
impl LocalTrainer for SlowTrainer {
    async fn train(&self, node: &Node, global: &[f64]) -> anyhow::Result<LocalUpdate> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        Ok(LocalUpdate { local_accuracy: node.local_accuracy, weights: vec![0.0; global.len()] })
    }
}

struct SlowFor {
    id: &'static str,
    delay: Duration,
}

#[async_trait]
impl LocalTrainer for SlowFor {
    async fn train(&self, node: &Node, global: &[f64]) -> anyhow::Result<LocalUpdate> {
        if node.id == self.id { tokio::time::sleep(self.delay).await; }
        Ok(LocalUpdate { local_accuracy: node.local_accuracy, weights: vec![0.0; global.len()] })
    }
}

struct Unreachable;

#[async_trait]
impl LocalTrainer for Unreachable {
    async fn train(&self, node: &Node, _global: &[f64]) -> anyhow::Result<LocalUpdate> {
        anyhow::bail!("{} unreachable", node.id)
    }
}

#[tokio::test]
async fn weighted_round_scenario() {
    let coord = RoundCoordinator::builder(near_noiseless(1)).trainer(Arc::new(WeightEcho)).build().unwrap();
    register_three(&coord);

    let m = coord.run_round().await.unwrap();
    assert_eq!(m.round, 1);
    assert_eq!(m.participating_nodes, 3);
    let snapshot = coord.registry().snapshot();
    let mean = snapshot.iter().map(|n| n.local_accuracy).sum::<f64>() / snapshot.len() as f64;
    assert!((m.global_accuracy - (mean + GLOBAL_ACCURACY_OFFSET)).abs() < 1e-12);
    assert!(snapshot.iter().all(|n| n.status == NodeStatus::Active));

    // (100*100 + 100*100 + 200*200) / 400
    let model = coord.global_model();
    assert_eq!(model.round, 1);
    assert!(model.weights.iter().all(|w| (w - 150.0).abs() < 1e-6));
}

#[tokio::test]
async fn empty_population_conserves_model_and_budget() {
    let coord = RoundCoordinator::new(full_participation(2)).unwrap();
    let before = coord.global_model();
    for _ in 0..3 {
        let m = coord.run_round().await.unwrap();
        assert_eq!(m.round, 0);
    }
    assert_eq!(coord.global_model(), before);
    assert_eq!(coord.ledger().rounds_executed, 0);
    assert_eq!(coord.privacy_view().remaining_budget, coord.config().total_privacy_budget);
}

#[tokio::test]
async fn budget_only_decreases_and_floors_at_zero() {
    let cfg = CoordinatorConfig { total_privacy_budget: 3.0, ..full_participation(3) };
    let coord = RoundCoordinator::new(cfg).unwrap();
    register_three(&coord);
    let mut last = f64::INFINITY;
    for n in 1..=5u64 {
        let m = coord.run_round().await.unwrap();
        assert!(m.privacy_budget_remaining <= last);
        assert!(m.privacy_budget_remaining >= 0.0);
        last = m.privacy_budget_remaining;
        assert_eq!(coord.ledger().rounds_executed, n);
        assert_eq!(coord.ledger().cumulative_epsilon(), n as f64);
    }
    assert_eq!(last, 0.0);
}

#[tokio::test]
async fn accuracies_stay_bounded_over_many_rounds() {
    let coord = RoundCoordinator::new(CoordinatorConfig { seed: Some(4), ..Default::default() }).unwrap();
    for i in 0..12 { coord.registry().upsert(&format!("node-{i:03}"), None).unwrap(); }
    for _ in 0..50 {
        let m = coord.run_round().await.unwrap();
        assert!((0.0..=MAX_LOCAL_ACCURACY).contains(&m.local_accuracy));
        assert!(m.global_accuracy <= 1.0);
    }
    assert_eq!(coord.global_model().round, 50);
    assert!(coord.registry().snapshot().iter().all(|n| (0.0..=MAX_LOCAL_ACCURACY).contains(&n.local_accuracy)));
}

#[tokio::test]
async fn failed_aggregation_leaves_round_untouched() {
    let coord = RoundCoordinator::builder(full_participation(5)).aggregator(Arc::new(BrokenAggregator)).build().unwrap();
    register_three(&coord);
    let model = coord.global_model();
    let ledger = coord.ledger();

    let err = coord.run_round().await.unwrap_err();
    assert!(matches!(err, FlError::RoundFailed { round: 1, .. }));
    assert_eq!(coord.global_model(), model);
    assert_eq!(coord.ledger(), ledger);
    assert_eq!(coord.publisher().latest().round, 0);
    assert!(coord.registry().snapshot().iter().all(|n| n.status == NodeStatus::Active));
}

#[tokio::test]
async fn silent_node_is_excluded_and_left_training() {
    let coord = RoundCoordinator::builder(full_participation(6)).trainer(Arc::new(FailsFor("b"))).build().unwrap();
    register_three(&coord);

    let m = coord.run_round().await.unwrap();
    assert_eq!(m.round, 1);
    assert_eq!(m.participating_nodes, 2);
    assert_eq!(coord.registry().get("b").unwrap().status, NodeStatus::Training);
    assert_eq!(coord.registry().get("a").unwrap().status, NodeStatus::Active);
}

#[tokio::test]
async fn forced_node_joins_and_listeners_fire_once_per_round() {
    let cfg = CoordinatorConfig { seed: Some(7), participation_rate_min: 0.05, participation_rate_max: 0.05, ..Default::default() };
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), &StoreConfig::default()));
    let coord = RoundCoordinator::builder(cfg).persistence(gateway).build().unwrap();
    for i in 0..30 { coord.registry().upsert(&format!("node-{i:03}"), None).unwrap(); }
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let _sub = coord.subscribe(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for r in 1..=3 {
        let m = coord.run_training_round(Some("node-017")).await.unwrap();
        assert_eq!(m.round, r);
        assert!(store.round(r).unwrap().participants.contains(&"node-017".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    coord.run_training_round(Some("newcomer")).await.unwrap();
    assert_eq!(coord.registry().get("newcomer").unwrap().status, NodeStatus::Active);
}

#[tokio::test]
async fn failing_store_never_fails_the_round() {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let store_cfg = StoreConfig { max_retries: 0, retry_base_delay_ms: 1, ..Default::default() };
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), &store_cfg));
    let coord = RoundCoordinator::builder(full_participation(8)).persistence(gateway).build().unwrap();
    register_three(&coord);

    let m = coord.run_round().await.unwrap();
    assert_eq!(m.round, 1);
    assert_eq!(store.round_count(), 0);
}

#[tokio::test]
async fn healthy_store_records_round_and_participants() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), &StoreConfig::default()));
    let coord = RoundCoordinator::builder(full_participation(9)).persistence(gateway).build().unwrap();
    register_three(&coord);

    coord.run_round().await.unwrap();
    let record = store.round(1).unwrap();
    assert_eq!(record.participants, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(store.node("c").unwrap().training_metrics.data_weight, 200);
    coord.flush_persistence().await.unwrap();
}

#[tokio::test]
async fn concurrent_triggers_are_serialized() {
    let coord = Arc::new(RoundCoordinator::new(full_participation(10)).unwrap());
    register_three(&coord);
    let results = join_all((0..8).map(|_| coord.run_round())).await;
    let rounds: BTreeSet<u64> = results.into_iter().map(|r| r.unwrap().round).collect();
    assert_eq!(rounds, (1..=8).collect());
    assert_eq!(coord.ledger().rounds_executed, 8);
}

#[tokio::test]
async fn scheduler_start_stop_is_idempotent() {
    let coord = Arc::new(RoundCoordinator::new(full_participation(11)).unwrap());
    let scheduler = RoundScheduler::new(coord, Duration::from_secs(3600));
    assert!(!scheduler.stop().await);
    assert!(scheduler.start());
    assert!(!scheduler.start());
    assert!(scheduler.is_running());
    assert!(scheduler.stop().await);
    assert!(!scheduler.is_running());
    assert!(!scheduler.stop().await);
}

#[tokio::test]
async fn stop_mid_round_lets_round_publish() {
    let started = Arc::new(Notify::new());
    let trainer = SlowTrainer { started: started.clone(), delay: Duration::from_millis(150) };
    let coord = Arc::new(RoundCoordinator::builder(full_participation(12)).trainer(Arc::new(trainer)).build().unwrap());
    coord.registry().upsert("solo", None).unwrap();
    let scheduler = RoundScheduler::new(coord.clone(), Duration::from_millis(20));

    assert!(scheduler.start());
    started.notified().await;
    assert!(scheduler.stop().await);
    assert_eq!(coord.publisher().latest().round, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coord.global_model().round, 1);
    assert_eq!(coord.publisher().history().len(), 1);
}

#[tokio::test]
async fn step_timeout_excludes_slow_node() {
    let cfg = CoordinatorConfig { local_step_timeout_ms: Some(20), ..full_participation(13) };
    let trainer = SlowFor { id: "b", delay: Duration::from_millis(200) };
    let coord = RoundCoordinator::builder(cfg).trainer(Arc::new(trainer)).build().unwrap();
    register_three(&coord);

    let m = coord.run_round().await.unwrap();
    assert_eq!(m.round, 1);
    assert_eq!(m.participating_nodes, 2);
    assert_eq!(coord.registry().get("b").unwrap().status, NodeStatus::Training);
    assert_eq!(coord.registry().get("c").unwrap().status, NodeStatus::Active);
}

#[tokio::test]
async fn all_silent_round_spends_nothing() {
    let coord = RoundCoordinator::builder(full_participation(14)).trainer(Arc::new(Unreachable)).build().unwrap();
    register_three(&coord);
    let model = coord.global_model();

    let m = coord.run_round().await.unwrap();
    assert_eq!(m.round, 0);
    assert_eq!(m, coord.current_metrics());
    assert_eq!(coord.global_model(), model);
    assert_eq!(coord.ledger().rounds_executed, 0);
    assert!(coord.publisher().history().is_empty());
    assert!(coord.registry().snapshot().iter().all(|n| n.status == NodeStatus::Training));
}

#[tokio::test]
async fn deactivation_during_round_sticks() {
    let started = Arc::new(Notify::new());
    let trainer = SlowTrainer { started: started.clone(), delay: Duration::from_millis(100) };
    let coord = RoundCoordinator::builder(full_participation(15)).trainer(Arc::new(trainer)).build().unwrap();
    register_three(&coord);

    let (first, forced, deactivated) = tokio::join!(coord.run_round(), coord.run_training_round(Some("a")), async {
        started.notified().await;
        coord.registry().deactivate("a")
    });
    assert_eq!(deactivated.unwrap().status, NodeStatus::Inactive);
    assert_eq!(first.unwrap().round, 1);
    assert!(matches!(forced, Err(FlError::InvalidArgument(_))));
    assert_eq!(coord.registry().get("a").unwrap().status, NodeStatus::Inactive);
    assert!(!coord.registry().select_participants(1.0).unwrap().contains("a"));

    coord.run_round().await.unwrap();
    assert_eq!(coord.registry().get("a").unwrap().status, NodeStatus::Inactive);
}

#[tokio::test]
async fn silent_participants_are_persisted_with_their_status() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), &StoreConfig::default()));
    let coord = RoundCoordinator::builder(full_participation(16)).trainer(Arc::new(FailsFor("b"))).persistence(gateway).build().unwrap();
    register_three(&coord);

    coord.run_round().await.unwrap();
    assert_eq!(store.round(1).unwrap().participants, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(store.node("b").unwrap().status, NodeStatus::Training);
    assert_eq!(store.node("a").unwrap().status, NodeStatus::Active);
}
