//! Retry with exponential backoff and a consecutive-failure circuit breaker,
//! used to keep persistence writes best-effort.

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 2, base_delay: Duration::from_millis(25), max_delay: Duration::from_millis(500), jitter: 0.25 } }
}

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let delay = exp.min(self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let spread = delay.as_secs_f64() * self.jitter.min(1.0);
        let offset = thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Runs `op` until it succeeds or `max_retries` extra attempts are used up;
/// returns the last error.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry_scheduled");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerState { Closed, Open { opened_at: Instant }, HalfOpen }

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<(BreakerState, u32)>,
    failure_threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self { state: Mutex::new((BreakerState::Closed, 0)), failure_threshold: failure_threshold.max(1), open_for }
    }

    /// Open breakers move to half-open once `open_for` has elapsed and let one trial through.
    pub fn allow(&self) -> bool {
        let mut st = self.state.lock();
        match st.0 {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { opened_at } if opened_at.elapsed() >= self.open_for => {
                debug!("breaker_half_open");
                st.0 = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) { *self.state.lock() = (BreakerState::Closed, 0); }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.1 += 1;
        let trip = matches!(st.0, BreakerState::HalfOpen) || (matches!(st.0, BreakerState::Closed) && st.1 >= self.failure_threshold);
        if trip {
            st.0 = BreakerState::Open { opened_at: Instant::now() };
            warn!(failures = st.1, "breaker_opened");
        }
    }

    pub fn state(&self) -> BreakerState { self.state.lock().0 }
}
