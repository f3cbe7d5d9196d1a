//! Differential-privacy accounting for the coordinator.
//!
//! Noise follows the Gaussian mechanism with `sigma = sensitivity / epsilon`.
//! Budget accounting is deliberately literal: every completed round spends one
//! `epsilon_per_round`, so `cumulative = epsilon_per_round * rounds`. This is a
//! placeholder figure and not a validated composition guarantee;
//! [`PrivacyLedger::advanced_composition_epsilon`] is reported alongside it for
//! reference only.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{FlError, FlResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyLedger {
    pub epsilon_per_round: f64,
    pub rounds_executed: u64,
}

impl PrivacyLedger {
    pub fn cumulative_epsilon(&self) -> f64 { self.epsilon_per_round * self.rounds_executed as f64 }

    /// Advanced composition bound for `k = rounds_executed` applications of an
    /// `epsilon_per_round` mechanism, at slack `delta`.
    pub fn advanced_composition_epsilon(&self, delta: f64) -> f64 {
        let k = self.rounds_executed as f64;
        if k == 0.0 || !(delta > 0.0 && delta < 1.0) { return 0.0; }
        let eps = self.epsilon_per_round;
        (2.0 * k * (1.0 / delta).ln()).sqrt() * eps + k * eps * (eps.exp() - 1.0)
    }
}

pub struct PrivacyAccountant {
    ledger: PrivacyLedger,
    rng: StdRng,
}

impl PrivacyAccountant {
    pub fn new(epsilon_per_round: f64, seed: Option<u64>) -> FlResult<Self> {
        check_positive("epsilon_per_round", epsilon_per_round)?;
        let rng = match seed { Some(s) => StdRng::seed_from_u64(s), None => StdRng::from_entropy() };
        Ok(Self { ledger: PrivacyLedger { epsilon_per_round, rounds_executed: 0 }, rng })
    }

    /// One N(mean, std) sample via Box–Muller over two uniform draws.
    pub fn gaussian_noise(&mut self, mean: f64, std: f64) -> f64 {
        // u1 in (0, 1] keeps ln finite
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std.max(0.0) * z
    }

    /// Adds independent `N(0, sensitivity / epsilon)` noise to every value.
    /// Does not touch the ledger.
    pub fn privatize(&mut self, values: &[f64], epsilon: f64, sensitivity: f64) -> FlResult<Vec<f64>> {
        check_positive("epsilon", epsilon)?;
        check_positive("sensitivity", sensitivity)?;
        let sigma = sensitivity / epsilon;
        Ok(values.iter().map(|v| v + self.gaussian_noise(0.0, sigma)).collect())
    }

    /// Records one round of spend. The argument does not change the amount:
    /// each call is exactly one `epsilon_per_round`.
    pub fn spend(&mut self, _epsilon: f64) { self.ledger.rounds_executed += 1; }

    pub fn remaining_budget(&self, total_budget: f64) -> f64 { (total_budget - self.ledger.cumulative_epsilon()).max(0.0) }

    pub fn ledger(&self) -> PrivacyLedger { self.ledger }
}

fn check_positive(name: &str, v: f64) -> FlResult<()> {
    if v > 0.0 && v.is_finite() { Ok(()) } else { Err(FlError::invalid(format!("{name} must be positive and finite, got {v}"))) }
}
