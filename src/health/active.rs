//! Active health checking.
//!
//! # Responsibilities
//! - Periodically run the registered callbacks against every instance
//! - Bound each callback with a timeout; errors, timeouts and panics fail the check
//! - Hand the combined result to the pool, which applies the state machine

use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::lifecycle::ShutdownSignal;
use crate::load_balancer::{HealthCheckFn, Instance, LoadBalancer};

/// Run every check against `instance`. Passes only if all of them return `Ok(true)`.
pub async fn check_instance(
    checks: &[(String, HealthCheckFn)],
    instance: &Instance,
    timeout: Duration,
) -> bool {
    let runs = checks.iter().map(|(name, check)| {
        let fut = AssertUnwindSafe(check(instance.clone())).catch_unwind();
        async move {
            match time::timeout(timeout, fut).await {
                Ok(Ok(Ok(true))) => true,
                Ok(Ok(Ok(false))) => {
                    tracing::warn!(instance = %instance.id, check = %name, "Health check failed");
                    false
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(instance = %instance.id, check = %name, error = %e, "Health check failed: error");
                    false
                }
                Ok(Err(_)) => {
                    tracing::error!(instance = %instance.id, check = %name, "Health check panicked");
                    false
                }
                Err(_) => {
                    tracing::warn!(instance = %instance.id, check = %name, "Health check failed: timeout");
                    false
                }
            }
        }
    });
    join_all(runs).await.into_iter().all(|passed| passed)
}

/// Drives [`LoadBalancer::run_health_checks`] on a fixed interval.
pub struct HealthMonitor {
    balancer: Arc<LoadBalancer>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(balancer: Arc<LoadBalancer>, config: HealthCheckConfig) -> Self {
        Self { balancer, config }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        if !self.config.enabled {
            tracing::info!(balancer = %self.balancer.name(), "Active health checks disabled");
            return;
        }

        tracing::info!(
            balancer = %self.balancer.name(),
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so instances get one interval of grace.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.balancer.run_health_checks().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(balancer = %self.balancer.name(), "Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::load_balancer::pool::health_check_fn;

    #[tokio::test]
    async fn test_all_checks_must_pass() {
        let inst = Instance::new("a", "h", 1);
        let ok = ("ok".to_string(), health_check_fn(|_| async { Ok(true) }));
        let down = ("down".to_string(), health_check_fn(|_| async { Ok(false) }));
        let err = ("err".to_string(), health_check_fn(|_| async { Err(BoxError::from("refused")) }));

        assert!(check_instance(&[ok.clone()], &inst, Duration::from_secs(1)).await);
        assert!(!check_instance(&[ok.clone(), down], &inst, Duration::from_secs(1)).await);
        assert!(!check_instance(&[ok, err], &inst, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_fail_the_check() {
        let inst = Instance::new("a", "h", 1);
        let slow = health_check_fn(|_| async {
            time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        });
        let panicky = health_check_fn(|inst: Instance| async move {
            if inst.port > 0 {
                panic!("probe bug");
            }
            Ok(true)
        });

        assert!(!check_instance(&[("slow".into(), slow)], &inst, Duration::from_millis(10)).await);
        assert!(!check_instance(&[("panicky".into(), panicky)], &inst, Duration::from_secs(1)).await);
    }
}
