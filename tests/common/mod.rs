//! Shared builders for integration tests.

#![allow(dead_code)]

use reliability_core::config::{InstanceConfig, ReliabilityConfig};
use reliability_core::resilience::BackoffStrategy;

/// Every component enabled except the rate limiter; background loops effectively idle.
pub fn base_config(name: &str) -> ReliabilityConfig {
    let mut config = ReliabilityConfig::default();
    config.manager.name = name.to_string();
    config.manager.alert_interval_ms = 60_000;
    config.rate_limiter.enabled = false;
    config.retry.strategy = BackoffStrategy::Fixed;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = false;
    config.load_balancer.health_check.enabled = false;
    config
}

pub fn instance(id: &str, port: u16, weight: f64) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        weight,
        max_connections: 100,
    }
}
