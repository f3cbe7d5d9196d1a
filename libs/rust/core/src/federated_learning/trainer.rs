//! Local-training capability. The coordinator only sees [`LocalTrainer`]; the
//! simulated random-walk trainer stands in until real model updates exist.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::registry::{clamp_accuracy, Node};

/// Result of one node's local step.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub local_accuracy: f64,
    /// Per-coordinate update, same length as the global model.
    pub weights: Vec<f64>,
}

#[async_trait]
pub trait LocalTrainer: Send + Sync {
    async fn train(&self, node: &Node, global_weights: &[f64]) -> Result<LocalUpdate>;
}

pub const ACCURACY_DRIFT: (f64, f64) = (-0.005, 0.02);
pub const UPDATE_SPREAD: f64 = 0.01;

pub struct SimulatedTrainer {
    rng: Mutex<StdRng>,
    dropout_rate: f64,
}

impl SimulatedTrainer {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed { Some(s) => StdRng::seed_from_u64(s), None => StdRng::from_entropy() };
        Self { rng: Mutex::new(rng), dropout_rate: 0.0 }
    }

    /// Probability that a node silently fails to report.
    pub fn with_dropout(mut self, rate: f64) -> Self {
        self.dropout_rate = rate.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl LocalTrainer for SimulatedTrainer {
    async fn train(&self, node: &Node, global_weights: &[f64]) -> Result<LocalUpdate> {
        let mut rng = self.rng.lock();
        if self.dropout_rate > 0.0 && rng.gen_bool(self.dropout_rate) {
            bail!("node {} dropped out", node.id);
        }
        let drift = rng.gen_range(ACCURACY_DRIFT.0..ACCURACY_DRIFT.1);
        let weights = global_weights.iter().map(|_| rng.gen_range(-UPDATE_SPREAD..UPDATE_SPREAD)).collect();
        Ok(LocalUpdate { local_accuracy: clamp_accuracy(node.local_accuracy + drift), weights })
    }
}
