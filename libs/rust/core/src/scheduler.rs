//! Periodic round driver behind the start/stop simulation controls.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::federated_learning::RoundCoordinator;

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RoundScheduler {
    coordinator: Arc<RoundCoordinator>,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl RoundScheduler {
    pub fn new(coordinator: Arc<RoundCoordinator>, period: Duration) -> Self {
        Self { coordinator, period, running: Mutex::new(None) }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().map(|r| !r.handle.is_finished()).unwrap_or(false)
    }

    /// Spawns the tick loop; first round fires one period from now. No-op
    /// (returns false) when already running. Must be called inside a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut slot = self.running.lock();
        if slot.as_ref().map(|r| !r.handle.is_finished()).unwrap_or(false) { return false; }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(tick_loop(self.coordinator.clone(), self.period, stop_rx));
        *slot = Some(Running { stop_tx, handle });
        if self.coordinator.registry().is_empty() {
            warn!("simulation_started_without_nodes");
        }
        info!(period_ms = self.period.as_millis() as u64, "simulation_started");
        true
    }

    /// Prevents further rounds and waits for the loop to exit. A round that is
    /// already running completes and publishes first. No-op when stopped.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        let Some(running) = running else { return false };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "scheduler_task_join_failed");
        }
        info!("simulation_stopped");
        true
    }
}

async fn tick_loop(coordinator: Arc<RoundCoordinator>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() { break; }
        match coordinator.run_round().await {
            Ok(m) => debug!(round = m.round, "scheduled_round_done"),
            Err(e) => warn!(error = %e, "scheduled_round_failed"),
        }
    }
}
