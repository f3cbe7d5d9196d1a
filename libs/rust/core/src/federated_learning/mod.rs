//! Federated learning: local-training capability, FedAvg aggregation and the
//! round coordinator that ties them to the registry and privacy accountant.

pub mod aggregator;
pub mod coordinator;
pub mod trainer;

pub use aggregator::{federated_average, AggregationMethod, Aggregator, FedAvg, NodeReport};
pub use coordinator::{CoordinatorBuilder, GlobalModel, PrivacyView, RoundCoordinator, RoundId, GLOBAL_ACCURACY_OFFSET};
pub use trainer::{LocalTrainer, LocalUpdate, SimulatedTrainer};
