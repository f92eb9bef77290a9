//! Round-robin load balancing strategies.

use crate::load_balancer::{Instance, LoadBalancingAlgorithm, Selector};

/// Slots per unit of weight in weighted rotation.
const WEIGHT_SCALE: f64 = 10.0;

/// Round-robin selector.
/// Stores an internal counter to rotate through candidates.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter % candidates.len();
        self.counter = self.counter.wrapping_add(1);
        Some(index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::RoundRobin
    }
}

/// Weighted round-robin.
///
/// Each candidate owns `round(weight × 10)` consecutive slots (at least one)
/// in a virtual rotation; the counter walks that rotation.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: usize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn slots(instance: &Instance) -> usize {
    ((instance.weight * WEIGHT_SCALE).round() as usize).max(1)
}

impl Selector for WeightedRoundRobin {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        let total: usize = candidates.iter().map(|c| slots(c)).sum();
        if total == 0 {
            return None;
        }

        let mut position = self.counter % total;
        self.counter = self.counter.wrapping_add(1);
        for (index, candidate) in candidates.iter().enumerate() {
            let owned = slots(candidate);
            if position < owned {
                return Some(index);
            }
            position -= owned;
        }
        None
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::WeightedRoundRobin
    }
}
