//! OpenTelemetry instruments for the training coordinator.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct FederatedLearningMetrics {
    pub rounds_total: Counter<u64>,
    pub rounds_failed_total: Counter<u64>,
    pub rounds_skipped_total: Counter<u64>,
    pub participants_total: Counter<u64>,
    pub rejected_updates_total: Counter<u64>,
    pub persistence_failures_total: Counter<u64>,
    pub listener_failures_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub round_duration_ms: Histogram<f64>,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedlearn_coordinator"));

pub static FL_METRICS: Lazy<FederatedLearningMetrics> = Lazy::new(|| FederatedLearningMetrics {
    rounds_total: FL_METER.u64_counter("fl_rounds_completed_total").with_description("Federated rounds committed").build(),
    rounds_failed_total: FL_METER.u64_counter("fl_rounds_failed_total").with_description("Rounds aborted before commit").build(),
    rounds_skipped_total: FL_METER.u64_counter("fl_rounds_skipped_total").with_description("Rounds with no reporting participant").build(),
    participants_total: FL_METER.u64_counter("fl_participants_total").with_description("Node updates aggregated").build(),
    rejected_updates_total: FL_METER.u64_counter("fl_rejected_updates_total").with_description("Selected nodes excluded for failing to report").build(),
    persistence_failures_total: FL_METER.u64_counter("fl_persistence_failures_total").with_description("Persistence writes that failed after retries").build(),
    listener_failures_total: FL_METER.u64_counter("fl_listener_failures_total").with_description("Metrics listeners that errored or panicked").build(),
    aggregation_latency_ms: FL_METER.f64_histogram("fl_aggregation_latency_ms").with_description("Aggregation + privatization latency").with_unit("ms").build(),
    round_duration_ms: FL_METER.f64_histogram("fl_round_duration_ms").with_description("End-to-end round duration").with_unit("ms").build(),
});
