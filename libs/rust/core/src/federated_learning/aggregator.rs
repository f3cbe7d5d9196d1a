//! FedAvg aggregation of per-node updates into the global weight vector.

use serde::{Deserialize, Serialize};

use crate::error::{FlError, FlResult};
use crate::registry::NodeId;

/// One participant's contribution: a per-coordinate update and the data weight
/// (local sample count proxy) it is averaged with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub weights: Vec<f64>,
    pub data_weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMethod { FedAvg }

/// Pure combination step; no hidden randomness.
pub trait Aggregator: Send + Sync {
    fn method(&self) -> AggregationMethod;
    fn aggregate(&self, global: &[f64], reports: &[NodeReport]) -> FlResult<Vec<f64>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FedAvg;

impl Aggregator for FedAvg {
    fn method(&self) -> AggregationMethod { AggregationMethod::FedAvg }

    fn aggregate(&self, global: &[f64], reports: &[NodeReport]) -> FlResult<Vec<f64>> { federated_average(global, reports) }
}

/// `global[i] + sum_k (w_k / W) * update_k[i]` with `W = sum_k w_k`.
/// Zero reports return `global` unchanged.
pub fn federated_average(global: &[f64], reports: &[NodeReport]) -> FlResult<Vec<f64>> {
    if reports.is_empty() { return Ok(global.to_vec()); }
    let dim = global.len();
    let mut total: u64 = 0;
    for r in reports {
        if r.weights.len() != dim {
            return Err(FlError::invalid(format!("update from {} has {} coordinates, model has {dim}", r.node_id, r.weights.len())));
        }
        if r.data_weight == 0 { return Err(FlError::invalid(format!("update from {} has zero data weight", r.node_id))); }
        total += u64::from(r.data_weight);
    }
    let total = total as f64;
    let mut out = global.to_vec();
    for r in reports {
        let share = f64::from(r.data_weight) / total;
        for (slot, v) in out.iter_mut().zip(&r.weights) { *slot += share * v; }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, weights: Vec<f64>, data_weight: u32) -> NodeReport {
        NodeReport { node_id: id.into(), weights, data_weight }
    }

    #[test]
    fn weighted_increment_is_added() {
        let reports = vec![report("n1", vec![0.1, 0.2, 0.3], 10), report("n2", vec![0.2, 0.4, 0.6], 30)];
        let out = federated_average(&[1.0, 1.0, 1.0], &reports).unwrap();
        // (0.1*10 + 0.2*30)/40 = 0.175
        assert!((out[0] - 1.175).abs() < 1e-12);
        assert!((out[2] - 1.525).abs() < 1e-12);
    }

    #[test]
    fn no_reports_is_a_noop() {
        let global = vec![0.5, -0.25];
        assert_eq!(federated_average(&global, &[]).unwrap(), global);
    }

    #[test]
    fn identical_inputs_give_bit_identical_outputs() {
        let global: Vec<f64> = (0..32).map(|i| (i as f64).sin()).collect();
        let reports: Vec<NodeReport> = (0..7)
            .map(|k| report(&format!("n{k}"), (0..32).map(|i| ((i * k) as f64).cos() * 1e-3).collect(), 50 + k as u32 * 13))
            .collect();
        let a = FedAvg.aggregate(&global, &reports).unwrap();
        let b = FedAvg.aggregate(&global, &reports).unwrap();
        assert_eq!(a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(), b.iter().map(|v| v.to_bits()).collect::<Vec<_>>());
    }

    #[test]
    fn fedavg_reports_its_method() {
        let agg: &dyn Aggregator = &FedAvg;
        assert_eq!(agg.method(), AggregationMethod::FedAvg);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let err = federated_average(&[0.0, 0.0], &[report("n1", vec![1.0], 5)]).unwrap_err();
        assert!(matches!(err, FlError::InvalidArgument(_)));
    }
}
