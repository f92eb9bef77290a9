//! Latency-driven algorithm switching.
//!
//! ```text
//! mean candidate latency > high threshold → least connections
//! mean candidate latency < low threshold  → weighted round robin
//! otherwise                               → health aware
//! ```
//!
//! Re-evaluated at most once per adaptation interval, on selection.

use std::time::{Duration, Instant};

use crate::config::LoadBalancerConfig;
use crate::load_balancer::{selector_for, Instance, LoadBalancingAlgorithm, Selector};

#[derive(Debug)]
pub struct Adaptive {
    current: LoadBalancingAlgorithm,
    inner: Box<dyn Selector>,
    interval: Duration,
    high: Duration,
    low: Duration,
    last_evaluation: Instant,
    config: LoadBalancerConfig,
}

impl Adaptive {
    pub fn new(config: &LoadBalancerConfig) -> Self {
        let current = LoadBalancingAlgorithm::WeightedRoundRobin;
        Self {
            current,
            inner: selector_for(current, config),
            interval: config.adaptation_interval(),
            high: config.high_latency_threshold(),
            low: config.low_latency_threshold(),
            last_evaluation: Instant::now(),
            config: config.clone(),
        }
    }

    fn choose(&self, mean: Duration) -> LoadBalancingAlgorithm {
        if mean > self.high {
            LoadBalancingAlgorithm::LeastConnections
        } else if mean < self.low {
            LoadBalancingAlgorithm::WeightedRoundRobin
        } else {
            LoadBalancingAlgorithm::HealthAware
        }
    }

    fn evaluate(&mut self, candidates: &[&Instance]) {
        let sampled: Vec<Duration> = candidates
            .iter()
            .filter(|c| c.has_response_times())
            .map(|c| c.average_response_time())
            .collect();
        if sampled.is_empty() {
            return;
        }

        let mean = sampled.iter().sum::<Duration>() / sampled.len() as u32;
        let next = self.choose(mean);
        if next != self.current {
            tracing::info!(
                from = ?self.current,
                to = ?next,
                mean_latency_ms = mean.as_millis() as u64,
                "Adaptive load balancer switching algorithm"
            );
            self.current = next;
            self.inner = selector_for(next, &self.config);
        }
    }
}

impl Selector for Adaptive {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_evaluation) >= self.interval {
            self.last_evaluation = now;
            self.evaluate(candidates);
        }
        self.inner.select(candidates)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::Adaptive
    }

    fn active_algorithm(&self) -> LoadBalancingAlgorithm {
        self.current
    }
}
