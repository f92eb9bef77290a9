//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! select_instance(context)
//!     → pool.rs (filter to available instances, minus exclusions)
//!     → Apply the selector:
//!         - round_robin.rs (plain and weighted rotation)
//!         - least_conn.rs (fewest connections, optionally per weight)
//!         - random.rs (uniform and weighted)
//!         - response_time.rs (fastest, health-aware score)
//!         - adaptive.rs (switches between the above on latency)
//!     → instance.rs (connection count incremented)
//! release_instance(id, response_time, success)
//!     → counters, response window, health state
//! ```
//!
//! Selectors only see available instances and return an index into that
//! slice. All mutation happens in the pool under one lock.

pub mod adaptive;
pub mod instance;
pub mod least_conn;
pub mod pool;
pub mod random;
pub mod response_time;
pub mod round_robin;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Debug;

use crate::config::LoadBalancerConfig;

pub use instance::{Instance, InstanceStatus};
pub use pool::{health_check_fn, HealthCheckFn, InstanceLease, InstanceMetrics, LoadBalancer, LoadBalancerMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    Random,
    WeightedRandom,
    ResponseTime,
    HealthAware,
    Adaptive,
}

/// Picks one instance out of the currently available candidates.
pub trait Selector: Send + Debug {
    /// Index into `candidates`, or `None` when it is empty.
    fn select(&mut self, candidates: &[&Instance]) -> Option<usize>;

    fn algorithm(&self) -> LoadBalancingAlgorithm;

    /// The algorithm actually in use; differs from `algorithm` for adaptive selection.
    fn active_algorithm(&self) -> LoadBalancingAlgorithm {
        self.algorithm()
    }
}

/// Per-call selection constraints.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Instance ids to skip, e.g. ones that already failed this caller.
    pub exclude: HashSet<String>,
}

impl SelectionContext {
    pub fn excluding<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: ids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Build the selector for `algorithm`.
pub fn selector_for(algorithm: LoadBalancingAlgorithm, config: &LoadBalancerConfig) -> Box<dyn Selector> {
    use LoadBalancingAlgorithm as A;
    match algorithm {
        A::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        A::WeightedRoundRobin => Box::new(round_robin::WeightedRoundRobin::new()),
        A::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        A::WeightedLeastConnections => Box::new(least_conn::WeightedLeastConnections::new()),
        A::Random => Box::new(random::Random::new()),
        A::WeightedRandom => Box::new(random::WeightedRandom::new()),
        A::ResponseTime => Box::new(response_time::ResponseTime::new()),
        A::HealthAware => Box::new(response_time::HealthAware::new()),
        A::Adaptive => Box::new(adaptive::Adaptive::new(config)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Instance;

    pub fn instances(n: usize) -> Vec<Instance> {
        (0..n)
            .map(|i| Instance::new(format!("i{}", i), "127.0.0.1", 8000 + i as u16))
            .collect()
    }

    pub fn refs(instances: &[Instance]) -> Vec<&Instance> {
        instances.iter().collect()
    }
}
