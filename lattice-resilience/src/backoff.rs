//! Backoff strategies for retry policies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,

    /// delay = initial_delay * attempt
    Linear,

    /// delay = initial_delay * base^(attempt-1)
    Exponential {
        /// Growth factor, 2.0 doubles the delay each time
        base: f64,
    },
}

impl BackoffStrategy {
    /// Doubling exponential backoff
    pub fn exponential() -> Self {
        BackoffStrategy::Exponential { base: 2.0 }
    }
}

/// Computes the wait before a given retry
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffCalculator {
    pub fn new(
        strategy: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
        jitter: bool,
    ) -> Self {
        Self {
            strategy,
            initial_delay,
            max_delay,
            jitter,
        }
    }

    /// Delay after the given failed attempt (1-indexed), capped at `max_delay`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt).min(self.max_delay);

        if self.jitter && !capped.is_zero() {
            // +/-20%
            let factor = rand::thread_rng().gen_range(0.8..1.2);
            Duration::from_nanos((capped.as_nanos() as f64 * factor) as u64)
        } else {
            capped
        }
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match &self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential { base } => {
                let multiplier = base.powi(attempt as i32 - 1);
                let nanos = self.initial_delay.as_nanos() as f64 * multiplier;
                if !nanos.is_finite() || nanos >= u64::MAX as f64 {
                    self.max_delay
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }
}
