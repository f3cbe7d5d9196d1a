//! Metrics publisher: latest-snapshot reads without locks, a bounded round
//! history, and synchronous listener notification.
//!
//! Listeners are isolated from one another: an `Err` return or a panic from
//! one listener is logged and the remaining listeners still run.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics_ext::FL_METRICS;

/// Snapshot published after each committed round. Accuracies are 0–1 fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundMetrics {
    pub round: u64,
    pub local_accuracy: f64,
    pub global_accuracy: f64,
    pub participating_nodes: usize,
    pub privacy_budget_remaining: f64,
    pub training_time_seconds: f64,
}

impl RoundMetrics {
    pub fn initial(total_budget: f64) -> Self {
        Self { round: 0, local_accuracy: 0.0, global_accuracy: 0.0, participating_nodes: 0, privacy_budget_remaining: total_budget, training_time_seconds: 0.0 }
    }
}

pub type Listener = Arc<dyn Fn(&RoundMetrics) -> anyhow::Result<()> + Send + Sync>;

type ListenerList = RwLock<Vec<(u64, Listener)>>;

/// Handle returned by [`MetricsPublisher::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    /// Returns false if the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(list) = self.listeners.upgrade() else { return false };
        let mut list = list.write();
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        list.len() != before
    }
}

pub struct MetricsPublisher {
    latest: ArcSwap<RoundMetrics>,
    history: RwLock<VecDeque<RoundMetrics>>,
    history_capacity: usize,
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
}

impl MetricsPublisher {
    pub fn new(initial: RoundMetrics, history_capacity: usize) -> Self {
        Self {
            latest: ArcSwap::from_pointee(initial),
            history: RwLock::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn latest(&self) -> RoundMetrics { self.latest.load().as_ref().clone() }

    pub fn history(&self) -> Vec<RoundMetrics> { self.history.read().iter().cloned().collect() }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RoundMetrics) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(callback)));
        Subscription { id, listeners: Arc::downgrade(&self.listeners) }
    }

    pub fn listener_count(&self) -> usize { self.listeners.read().len() }

    /// Stores the snapshot, then notifies every listener once. Returns how many
    /// listeners failed.
    pub fn publish(&self, metrics: RoundMetrics) -> usize {
        self.latest.store(Arc::new(metrics.clone()));
        {
            let mut history = self.history.write();
            if self.history_capacity > 0 {
                if history.len() == self.history_capacity { history.pop_front(); }
                history.push_back(metrics.clone());
            }
        }
        // snapshot so listeners may (un)subscribe while being notified
        let listeners: Vec<(u64, Listener)> = self.listeners.read().clone();
        let mut failed = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&metrics))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id, round = metrics.round, error = %e, "metrics_listener_failed");
                    failed += 1;
                }
                Err(_) => {
                    warn!(listener = id, round = metrics.round, "metrics_listener_panicked");
                    failed += 1;
                }
            }
        }
        if failed > 0 { FL_METRICS.listener_failures_total.add(failed as u64, &[]); }
        failed
    }
}
