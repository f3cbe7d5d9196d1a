//! Node registry: per-participant state, Bernoulli participant selection and
//! bulk status transitions.
//!
//! Nodes are kept in a `BTreeMap` so iteration (and therefore seeded
//! selection) is ordered by id.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlError, FlResult};

pub type NodeId = String;

/// No node is ever modelled as perfect.
pub const MAX_LOCAL_ACCURACY: f64 = 0.98;
pub const DEFAULT_ACCURACY_RANGE: (f64, f64) = (0.70, 0.90);
pub const DEFAULT_DATA_WEIGHT_RANGE: (u32, u32) = (50, 200);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus { Idle, Active, Training, Inactive }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub status: NodeStatus,
    pub local_accuracy: f64,
    pub data_weight: u32,
    pub last_update: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, local_accuracy: f64, data_weight: u32) -> FlResult<Self> {
        if data_weight == 0 { return Err(FlError::invalid("data_weight must be > 0")); }
        Ok(Self { id: id.into(), status: NodeStatus::Idle, local_accuracy: clamp_accuracy(local_accuracy), data_weight, last_update: Utc::now() })
    }

    pub fn is_eligible(&self) -> bool { self.status != NodeStatus::Inactive }

    fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
        self.last_update = Utc::now();
    }
}

pub fn clamp_accuracy(acc: f64) -> f64 {
    if acc.is_nan() { return 0.0; }
    acc.clamp(0.0, MAX_LOCAL_ACCURACY)
}

pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    rng: Mutex<StdRng>,
}

impl NodeRegistry {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed { Some(s) => StdRng::seed_from_u64(s), None => StdRng::from_entropy() };
        Self { nodes: RwLock::new(BTreeMap::new()), rng: Mutex::new(rng) }
    }

    /// Creates the node with randomised defaults when absent; an existing node
    /// is returned unchanged (the supplied weight is ignored in that case).
    pub fn upsert(&self, id: &str, data_weight: Option<u32>) -> FlResult<Node> {
        if id.is_empty() { return Err(FlError::invalid("node id must not be empty")); }
        if data_weight == Some(0) { return Err(FlError::invalid("data_weight must be > 0")); }
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(id) { return Ok(existing.clone()); }
        let (acc, weight) = {
            let mut rng = self.rng.lock();
            let acc = rng.gen_range(DEFAULT_ACCURACY_RANGE.0..=DEFAULT_ACCURACY_RANGE.1);
            let weight = data_weight.unwrap_or_else(|| rng.gen_range(DEFAULT_DATA_WEIGHT_RANGE.0..=DEFAULT_DATA_WEIGHT_RANGE.1));
            (acc, weight)
        };
        let node = Node::new(id, acc, weight)?;
        debug!(node_id = %id, data_weight = weight, local_accuracy = acc, "node_registered");
        nodes.insert(id.to_string(), node.clone());
        Ok(node)
    }

    /// Inserts or replaces a fully specified node (state restored from an external store).
    pub fn register(&self, mut node: Node) -> FlResult<()> {
        if node.data_weight == 0 { return Err(FlError::invalid("data_weight must be > 0")); }
        node.local_accuracy = clamp_accuracy(node.local_accuracy);
        self.nodes.write().insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get(&self, id: &str) -> FlResult<Node> {
        self.nodes.read().get(id).cloned().ok_or_else(|| FlError::NotFound(id.to_string()))
    }

    /// Independently includes each eligible node with probability `rate`. If
    /// every draw fails one eligible node is forced in, so the result is only
    /// empty when no eligible node exists.
    pub fn select_participants(&self, rate: f64) -> FlResult<BTreeSet<NodeId>> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(FlError::invalid(format!("participation rate must lie in (0, 1], got {rate}")));
        }
        let nodes = self.nodes.read();
        let eligible: Vec<&NodeId> = nodes.values().filter(|n| n.is_eligible()).map(|n| &n.id).collect();
        let mut rng = self.rng.lock();
        let mut selected: BTreeSet<NodeId> = eligible.iter().filter(|_| rng.gen_bool(rate)).map(|id| (*id).clone()).collect();
        if selected.is_empty() {
            if let Some(forced) = eligible.choose(&mut *rng) { selected.insert((*forced).clone()); }
        }
        Ok(selected)
    }

    /// Idle, Active and still-Training nodes move to Training.
    pub fn mark_training(&self, ids: &[NodeId]) -> FlResult<()> {
        self.transition(ids, NodeStatus::Training, |s| s != NodeStatus::Inactive)
    }

    /// Only Training nodes move to Active.
    pub fn mark_active(&self, ids: &[NodeId]) -> FlResult<()> {
        self.transition(ids, NodeStatus::Active, |s| s == NodeStatus::Training)
    }

    /// All-or-nothing: an unknown id rejects the whole batch. Nodes whose
    /// current status fails `from` are left as they are, so a deactivation
    /// made while a round runs is never undone by it.
    fn transition(&self, ids: &[NodeId], status: NodeStatus, from: impl Fn(NodeStatus) -> bool) -> FlResult<()> {
        let mut nodes = self.nodes.write();
        if let Some(missing) = ids.iter().find(|id| !nodes.contains_key(id.as_str())) {
            return Err(FlError::NotFound(missing.clone()));
        }
        for id in ids {
            match nodes.get_mut(id) {
                Some(node) if from(node.status) => node.set_status(status),
                Some(node) => debug!(node_id = %id, status = ?node.status, to = ?status, "transition_skipped"),
                None => {}
            }
        }
        Ok(())
    }

    /// Stores post-training accuracies, clamped to `[0, MAX_LOCAL_ACCURACY]`.
    pub fn record_accuracies(&self, updates: &[(NodeId, f64)]) -> FlResult<()> {
        let mut nodes = self.nodes.write();
        if let Some((missing, _)) = updates.iter().find(|(id, _)| !nodes.contains_key(id.as_str())) {
            return Err(FlError::NotFound(missing.clone()));
        }
        let now = Utc::now();
        for (id, acc) in updates {
            if let Some(node) = nodes.get_mut(id) {
                node.local_accuracy = clamp_accuracy(*acc);
                node.last_update = now;
            }
        }
        Ok(())
    }

    pub fn deactivate(&self, id: &str) -> FlResult<Node> { self.set_single(id, NodeStatus::Inactive) }

    pub fn reactivate(&self, id: &str) -> FlResult<Node> { self.set_single(id, NodeStatus::Idle) }

    fn set_single(&self, id: &str, status: NodeStatus) -> FlResult<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(id).ok_or_else(|| FlError::NotFound(id.to_string()))?;
        node.set_status(status);
        Ok(node.clone())
    }

    pub fn snapshot(&self) -> Vec<Node> { self.nodes.read().values().cloned().collect() }

    pub fn len(&self) -> usize { self.nodes.read().len() }

    pub fn is_empty(&self) -> bool { self.nodes.read().is_empty() }

    pub fn mean_accuracy(&self) -> Option<f64> {
        let nodes = self.nodes.read();
        if nodes.is_empty() { return None; }
        Some(nodes.values().map(|n| n.local_accuracy).sum::<f64>() / nodes.len() as f64)
    }
}
