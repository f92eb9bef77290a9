//! Latency-driven load balancing strategies.

use crate::load_balancer::{Instance, LoadBalancingAlgorithm, Selector};

/// Picks the candidate with the lowest mean response time.
/// Candidates without samples count as zero, so new instances get tried.
#[derive(Debug, Default)]
pub struct ResponseTime;

impl ResponseTime {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for ResponseTime {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.average_response_time())
            .map(|(index, _)| index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::ResponseTime
    }
}

/// Picks the candidate with the best combined score:
/// `success_rate × weight / (avg_rt_secs + 1) / (load_factor + 0.1)`.
#[derive(Debug, Default)]
pub struct HealthAware;

impl HealthAware {
    pub fn new() -> Self {
        Self
    }
}

pub fn health_score(instance: &Instance) -> f64 {
    let rt = instance.average_response_time().as_secs_f64();
    instance.success_rate() * instance.weight / (rt + 1.0) / (instance.load_factor() + 0.1)
}

impl Selector for HealthAware {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        // max_by keeps the last maximum; iterate reversed so ties go to the first.
        candidates
            .iter()
            .enumerate()
            .rev()
            .max_by(|(_, a), (_, b)| health_score(a).total_cmp(&health_score(b)))
            .map(|(index, _)| index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::HealthAware
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{instances, refs};
    use std::time::{Duration, Instant};

    #[test]
    fn test_fastest_wins() {
        let now = Instant::now();
        let mut pool = instances(2);
        pool[0].record_response(Duration::from_millis(300), true, now);
        pool[1].record_response(Duration::from_millis(50), true, now);
        assert_eq!(ResponseTime::new().select(&refs(&pool)), Some(1));
    }

    #[test]
    fn test_health_aware_penalises_failures_and_load() {
        let now = Instant::now();
        let mut pool = instances(3);
        pool[0].record_response(Duration::from_millis(10), false, now);
        pool[1].current_connections = 50;

        let mut lb = HealthAware::new();
        assert_eq!(lb.select(&refs(&pool)), Some(2));

        // Equal scores go to the first candidate.
        let fresh = instances(2);
        assert_eq!(lb.select(&refs(&fresh)), Some(0));
    }
}
