//! Least Connections load balancing strategies.

use crate::load_balancer::{Instance, LoadBalancingAlgorithm, Selector};

/// Least connections selector.
/// Selects the candidate with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for LeastConnections {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        // In case of tie, the first one is selected (stability)
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.current_connections)
            .map(|(index, _)| index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::LeastConnections
    }
}

/// Fewest connections per unit of weight.
#[derive(Debug, Default)]
pub struct WeightedLeastConnections;

impl WeightedLeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for WeightedLeastConnections {
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let a = f64::from(a.current_connections) / a.weight;
                let b = f64::from(b.current_connections) / b.weight;
                a.total_cmp(&b)
            })
            .map(|(index, _)| index)
    }

    fn algorithm(&self) -> LoadBalancingAlgorithm {
        LoadBalancingAlgorithm::WeightedLeastConnections
    }
}
