//! Random load balancing strategies.

use crate::load_balancer::{Instance, LoadBalancingAlgorithm, Selector};

#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for Random {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(fastrand::usize(..candidates.len()))
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::Random
    }
}

/// Picks a candidate with probability proportional to its weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for WeightedRandom {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        let total: f64 = candidates.iter().map(|c| c.weight).sum();
        if candidates.is_empty() || total <= 0.0 {
            return None;
        }

        let mut point = fastrand::f64() * total;
        for (index, candidate) in candidates.iter().enumerate() {
            if point < candidate.weight {
                return Some(index);
            }
            point -= candidate.weight;
        }
        // Float rounding can leave `point` just past the last weight.
        Some(candidates.len() - 1)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::WeightedRandom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::{instances, refs};

    #[test]
    fn test_random_stays_in_bounds() {
        let mut lb = Random::new();
        let pool = instances(3);
        for _ in 0..100 {
            assert!(lb.select(&refs(&pool)).unwrap() < 3);
        }
        assert_eq!(lb.select(&[]), None);
    }

    #[test]
    fn test_weighted_random_favours_heavy_instance() {
        let mut lb = WeightedRandom::new();
        let mut pool = instances(2);
        pool[1].weight = 9.0;

        let heavy = (0..2000)
            .filter(|_| lb.select(&refs(&pool)) == Some(1))
            .count();
        // Expected 1800; loose bounds keep this deterministic in practice.
        assert!(heavy > 1600 && heavy < 1950, "heavy = {}", heavy);
    }
}
