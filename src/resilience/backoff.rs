//! Retry delay computation with jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorKind;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
    /// Exponential, with the exponent nudged by the recent success rate.
    Adaptive,
}

/// Jitter band applied on top of the computed delay (±10%).
const JITTER_RATIO: f64 = 0.1;

/// Delay parameters for one retry handler.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based).
    ///
    /// `healthy` is only consulted by the adaptive strategy: true when the
    /// recent success rate is above the handler's success threshold.
    pub fn delay(&self, attempt: u32, kind: ErrorKind, healthy: bool) -> Duration {
        let delay = self.raw_delay(attempt, kind, healthy);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Delay before jitter, clamped to `max`.
    pub fn raw_delay(&self, attempt: u32, kind: ErrorKind, healthy: bool) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base.as_secs_f64() * kind_multiplier(kind);

        let secs = match self.strategy {
            BackoffStrategy::Exponential => base * self.multiplier.powi(attempt as i32 - 1),
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Fibonacci => base * fibonacci(attempt) as f64,
            BackoffStrategy::Adaptive => {
                let exponent = attempt as i32 - 1;
                let exponent = if healthy { (exponent - 1).max(0) } else { exponent + 1 };
                base * self.multiplier.powi(exponent)
            }
        };

        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()).max(0.0))
    }
}

fn kind_multiplier(kind: ErrorKind) -> f64 {
    match kind {
        ErrorKind::RateLimited => 2.0,
        ErrorKind::Timeout => 1.5,
        _ => 1.0,
    }
}

/// Spread a delay uniformly over ±10%.
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// fib(1) = fib(2) = 1. Saturates instead of overflowing.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
