//! Instance pool management.
//!
//! # Responsibilities
//! - Own the instances and the selection algorithm behind one lock
//! - Track connection slots through selection, release and abandon
//! - Provide leases that free their slot on drop
//! - Run registered health checks and apply their results

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, LoadBalancerConfig};
use crate::error::BoxError;
use crate::health::{self, Transition};
use crate::load_balancer::{
    selector_for, Instance, InstanceStatus, LoadBalancingAlgorithm, SelectionContext, Selector,
};
use crate::observability::metrics;

/// Health check callback: `Ok(true)` means the instance is healthy.
pub type HealthCheckFn =
    Arc<dyn Fn(Instance) -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;

/// Box an async closure into a [`HealthCheckFn`].
pub fn health_check_fn<F, Fut>(check: F) -> HealthCheckFn
where
    F: Fn(Instance) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
{
    Arc::new(move |instance| check(instance).boxed())
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub id: String,
    pub address: String,
    pub status: InstanceStatus,
    pub weight: f64,
    pub current_connections: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub load_factor: f64,
}

impl From<&Instance> for InstanceMetrics {
    fn from(instance: &Instance) -> Self {
        Self {
            id: instance.id.clone(),
            address: instance.address(),
            status: instance.status,
            weight: instance.weight,
            current_connections: instance.current_connections,
            total_requests: instance.total_requests,
            successful_requests: instance.successful_requests,
            failed_requests: instance.failed_requests,
            success_rate: instance.success_rate(),
            average_response_time_ms: instance.average_response_time().as_secs_f64() * 1000.0,
            load_factor: instance.load_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerMetrics {
    pub name: String,
    pub algorithm: LoadBalancingAlgorithm,
    /// Differs from `algorithm` only for adaptive selection.
    pub active_algorithm: LoadBalancingAlgorithm,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub available_instances: usize,
    pub total_selections: u64,
    /// Selections that found no available instance.
    pub failed_selections: u64,
    pub instances: Vec<InstanceMetrics>,
}

#[derive(Debug)]
struct PoolState {
    instances: Vec<Instance>,
    selector: Box<dyn Selector>,
    total_selections: u64,
    failed_selections: u64,
}

/// Pool of named instances with pluggable selection.
pub struct LoadBalancer {
    name: String,
    config: LoadBalancerConfig,
    state: Mutex<PoolState>,
    health_checks: DashMap<String, HealthCheckFn>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("algorithm", &self.config.algorithm)
            .field("health_checks", &self.health_checks.len())
            .finish()
    }
}

impl LoadBalancer {
    /// Create a pool seeded with `config.instances`.
    pub fn new(name: impl Into<String>, config: LoadBalancerConfig) -> Result<Self, ConfigError> {
        ConfigError::check(config.violations())?;
        let name = name.into();

        let instances: Vec<Instance> = config
            .instances
            .iter()
            .map(|c| Instance::from_config(c).with_response_time_window(config.response_time_window))
            .collect();

        tracing::info!(
            balancer = %name,
            algorithm = ?config.algorithm,
            instances = instances.len(),
            "Load balancer created"
        );
        for instance in &instances {
            metrics::record_instance_health(&name, &instance.id, true);
        }

        Ok(Self {
            state: Mutex::new(PoolState {
                instances,
                selector: selector_for(config.algorithm, &config),
                total_selections: 0,
                failed_selections: 0,
            }),
            health_checks: DashMap::new(),
            name,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Add an instance. Returns `false` if the id is already registered.
    pub fn add_instance(&self, instance: Instance) -> bool {
        let mut state = self.state.lock();
        if state.instances.iter().any(|i| i.id == instance.id) {
            tracing::warn!(balancer = %self.name, instance = %instance.id, "Duplicate instance id, ignoring");
            return false;
        }
        let instance = instance.with_response_time_window(self.config.response_time_window);
        tracing::info!(balancer = %self.name, instance = %instance.id, address = %instance.address(), "Instance added");
        metrics::record_instance_health(&self.name, &instance.id, instance.status == InstanceStatus::Healthy);
        state.instances.push(instance);
        true
    }

    pub fn remove_instance(&self, id: &str) -> Option<Instance> {
        let mut state = self.state.lock();
        let pos = state.instances.iter().position(|i| i.id == id)?;
        let removed = state.instances.remove(pos);
        tracing::info!(balancer = %self.name, instance = %id, "Instance removed");
        Some(removed)
    }

    /// Pick an available instance and reserve a connection slot on it.
    ///
    /// The returned value is a snapshot; the slot must be handed back through
    /// [`release_instance`](Self::release_instance) or
    /// [`abandon_instance`](Self::abandon_instance).
    pub fn select_instance(&self, context: Option<&SelectionContext>) -> Option<Instance> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.total_selections += 1;

        let (indices, candidates): (Vec<usize>, Vec<&Instance>) = state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_available())
            .filter(|(_, i)| context.map_or(true, |ctx| !ctx.exclude.contains(&i.id)))
            .unzip();

        let picked = state
            .selector
            .select(&candidates)
            .and_then(|c| indices.get(c).copied());

        let Some(index) = picked else {
            state.failed_selections += 1;
            tracing::debug!(
                balancer = %self.name,
                total = state.instances.len(),
                "No available instance"
            );
            return None;
        };

        let instance = &mut state.instances[index];
        instance.current_connections += 1;
        instance.total_requests += 1;
        metrics::record_instance_selected(&self.name, &instance.id);
        Some(instance.clone())
    }

    /// Like [`select_instance`](Self::select_instance), wrapped in a lease.
    pub fn acquire(&self, context: Option<&SelectionContext>) -> Option<InstanceLease<'_>> {
        self.select_instance(context).map(|instance| InstanceLease {
            balancer: self,
            instance,
            settled: false,
        })
    }

    /// Return a connection slot and record the request outcome.
    /// Returns `false` if the instance is no longer in the pool.
    pub fn release_instance(&self, id: &str, response_time: Duration, success: bool) -> bool {
        let mut state = self.state.lock();
        let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) else {
            return false;
        };

        instance.current_connections = instance.current_connections.saturating_sub(1);
        instance.record_response(response_time, success, Instant::now());
        if health::apply_request_outcome(instance, self.config.max_failures) == Transition::BecameUnhealthy {
            tracing::warn!(
                balancer = %self.name,
                instance = %id,
                consecutive_failures = instance.consecutive_failures,
                "Instance marked unhealthy"
            );
            metrics::record_instance_health(&self.name, id, false);
        }
        true
    }

    /// Return a connection slot without recording an outcome.
    pub fn abandon_instance(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.instances.iter_mut().find(|i| i.id == id) {
            Some(instance) => {
                instance.current_connections = instance.current_connections.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Operator override, e.g. draining before removal.
    pub fn set_instance_status(&self, id: &str, status: InstanceStatus) -> bool {
        let mut state = self.state.lock();
        let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        let previous = instance.status;
        instance.status = status;
        if status == InstanceStatus::Healthy {
            instance.consecutive_failures = 0;
        }
        tracing::info!(balancer = %self.name, instance = %id, from = ?previous, to = ?status, "Instance status set");
        metrics::record_instance_health(&self.name, id, status == InstanceStatus::Healthy);
        true
    }

    pub fn register_health_check<F, Fut>(&self, name: impl Into<String>, check: F)
    where
        F: Fn(Instance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        self.health_checks.insert(name.into(), health_check_fn(check));
    }

    pub fn unregister_health_check(&self, name: &str) -> bool {
        self.health_checks.remove(name).is_some()
    }

    /// Run one pass of every registered check against every instance.
    ///
    /// A pass with no registered checks changes nothing.
    pub async fn run_health_checks(&self) {
        let checks: Vec<(String, HealthCheckFn)> = self
            .health_checks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if checks.is_empty() {
            return;
        }

        let snapshot = self.instances();
        let timeout = self.config.health_check.timeout();
        let results = join_all(snapshot.iter().map(|instance| {
            let checks = &checks;
            async move {
                let passed = health::active::check_instance(checks, instance, timeout).await;
                (instance.id.as_str(), passed)
            }
        }))
        .await;

        let now = Instant::now();
        let mut state = self.state.lock();
        for (id, passed) in results {
            // Removed while the checks ran.
            let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) else {
                continue;
            };
            match health::apply_check_result(
                instance,
                passed,
                self.config.max_failures,
                self.config.recovery_time(),
                now,
            ) {
                Transition::BecameUnhealthy => {
                    tracing::warn!(balancer = %self.name, instance = %id, "Instance failed health checks, marked unhealthy");
                    metrics::record_instance_health(&self.name, id, false);
                }
                Transition::Recovered => {
                    tracing::info!(balancer = %self.name, instance = %id, "Instance recovered");
                    metrics::record_instance_health(&self.name, id, true);
                }
                Transition::Unchanged => {}
            }
        }
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.state.lock().instances.iter().find(|i| i.id == id).cloned()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().instances.clone()
    }

    pub fn healthy_instances(&self) -> Vec<Instance> {
        self.state
            .lock()
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .cloned()
            .collect()
    }

    pub fn get_metrics(&self) -> LoadBalancerMetrics {
        let state = self.state.lock();
        LoadBalancerMetrics {
            name: self.name.clone(),
            algorithm: state.selector.algorithm(),
            active_algorithm: state.selector.active_algorithm(),
            total_instances: state.instances.len(),
            healthy_instances: state
                .instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Healthy)
                .count(),
            available_instances: state.instances.iter().filter(|i| i.is_available()).count(),
            total_selections: state.total_selections,
            failed_selections: state.failed_selections,
            instances: state.instances.iter().map(InstanceMetrics::from).collect(),
        }
    }

    /// Clear statistics, mark unhealthy instances healthy and rebuild the selector.
    /// Draining and maintenance states are operator decisions and stay.
    /// Connection counts are kept; leases still in flight will return them.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for instance in &mut state.instances {
            instance.clear_stats();
            if instance.status == InstanceStatus::Unhealthy {
                instance.status = InstanceStatus::Healthy;
            }
            metrics::record_instance_health(
                &self.name,
                &instance.id,
                instance.status == InstanceStatus::Healthy,
            );
        }
        state.selector = selector_for(self.config.algorithm, &self.config);
        state.total_selections = 0;
        state.failed_selections = 0;
        tracing::info!(balancer = %self.name, "Load balancer reset");
    }
}

/// A reserved connection slot.
///
/// Settle it with [`release`](Self::release); dropping it unsettled frees the
/// slot without recording an outcome.
#[must_use]
#[derive(Debug)]
pub struct InstanceLease<'a> {
    balancer: &'a LoadBalancer,
    instance: Instance,
    settled: bool,
}

impl InstanceLease<'_> {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn release(mut self, response_time: Duration, success: bool) {
        self.settled = true;
        self.balancer
            .release_instance(&self.instance.id, response_time, success);
    }
}

impl Drop for InstanceLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.balancer.abandon_instance(&self.instance.id);
        }
    }
}
