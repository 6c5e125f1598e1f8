//! Adaptive chunk-size and inter-attempt wait controllers.

use std::collections::VecDeque;
use std::time::Duration;

use turbfetch_core::config::Tunable;

/// Proportional controller for the chunk size.
///
/// Weights are log-spaced over `10^0.1 ..= 10^1` so the newest outcome counts about
/// eight times the oldest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeController {
    pub update_factor: f64,
    pub min: f64,
    pub max: f64,
}

impl SizeController {
    pub fn from_tunable(t: &Tunable) -> Self {
        Self {
            update_factor: t.query_limit_update_factor,
            min: t.query_limit_range[0] as f64,
            max: t.query_limit_range[1] as f64,
        }
    }

    /// `history` is oldest first.
    pub fn next_limit(&self, history: &VecDeque<bool>, current: f64) -> f64 {
        if history.len() < 2 {
            return current;
        }
        let score = weighted_score(history);
        let centered = 2.0 * score - 1.0;
        let delta = centered * self.update_factor * current;
        (current + delta).min(self.max).max(self.min)
    }
}

fn weighted_score(history: &VecDeque<bool>) -> f64 {
    let exponents = turbfetch_core::types::linspace(0.1, 1.0, history.len());
    let weights: Vec<f64> = exponents.iter().map(|e| 10f64.powf(*e)).collect();
    let total: f64 = weights.iter().sum();
    history
        .iter()
        .zip(&weights)
        .filter(|(passed, _)| **passed)
        .map(|(_, w)| w / total)
        .sum()
}

/// Geometric backoff with a grace period of `padding` failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffController {
    pub min: f64,
    pub max: f64,
    pub growth: f64,
    pub padding: u32,
}

impl BackoffController {
    pub fn from_tunable(t: &Tunable) -> Self {
        Self {
            min: t.wait_range[0],
            max: t.wait_range[1],
            growth: t.wait_update_factor,
            padding: t.wait_update_padding,
        }
    }

    /// Resets the streak; the next wait is the minimum.
    pub fn on_success(&self, consecutive_fails: &mut u32) -> Duration {
        *consecutive_fails = 0;
        secs(self.min)
    }

    /// `consecutive_fails` must already include the failure being handled.
    pub fn on_failure(&self, consecutive_fails: u32) -> Duration {
        if consecutive_fails <= self.padding {
            return secs(self.min);
        }
        let exponent = (consecutive_fails - self.padding).min(i32::MAX as u32) as i32;
        secs((self.min * self.growth.powi(exponent)).min(self.max))
    }
}

fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v.max(0.0)).unwrap_or(Duration::MAX)
}
