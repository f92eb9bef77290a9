//! Configuration validation.
//!
//! Serde handles the syntax; this module checks value ranges and cross-field
//! constraints. Every violation is reported, not just the first one.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::{
    CircuitBreakerConfig, LoadBalancerConfig, ManagerConfig, RateLimiterConfig, ReliabilityConfig,
    RetryConfig,
};

/// A single semantic violation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Validate every section of the configuration.
pub fn validate_config(config: &ReliabilityConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    errors.extend(config.circuit_breaker.violations());
    errors.extend(config.rate_limiter.violations());
    errors.extend(config.retry.violations());
    errors.extend(config.load_balancer.violations());
    errors.extend(config.manager.violations());

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check(errors: &mut Vec<ValidationError>, ok: bool, field: &str, reason: &str) {
    if !ok {
        errors.push(ValidationError::new(field, reason));
    }
}

fn is_ratio(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

impl CircuitBreakerConfig {
    pub fn violations(&self) -> Vec<ValidationError> {
        let mut e = Vec::new();
        check(&mut e, self.failure_threshold > 0, "circuit_breaker.failure_threshold", "must be > 0");
        check(&mut e, self.success_threshold > 0, "circuit_breaker.success_threshold", "must be > 0");
        check(&mut e, self.timeout_ms > 0, "circuit_breaker.timeout_ms", "must be > 0");
        check(&mut e, self.half_open_max_calls > 0, "circuit_breaker.half_open_max_calls", "must be > 0");
        check(
            &mut e,
            self.success_threshold <= self.half_open_max_calls,
            "circuit_breaker.success_threshold",
            "must not exceed half_open_max_calls",
        );
        check(&mut e, self.sliding_window_size > 0, "circuit_breaker.sliding_window_size", "must be > 0");
        check(
            &mut e,
            is_ratio(self.failure_rate_threshold),
            "circuit_breaker.failure_rate_threshold",
            "must be within 0.0..=1.0",
        );
        e
    }
}

impl RateLimiterConfig {
    pub fn violations(&self) -> Vec<ValidationError> {
        let mut e = Vec::new();
        check(
            &mut e,
            self.requests_per_second.is_finite() && self.requests_per_second > 0.0,
            "rate_limiter.requests_per_second",
            "must be a positive number",
        );
        check(&mut e, self.burst_size > 0, "rate_limiter.burst_size", "must be > 0");
        check(&mut e, self.window_ms > 0, "rate_limiter.window_ms", "must be > 0");
        check(&mut e, self.max_requests > 0, "rate_limiter.max_requests", "must be > 0");
        check(
            &mut e,
            !self.enable_queue || self.max_queue_size > 0,
            "rate_limiter.max_queue_size",
            "must be > 0 when the queue is enabled",
        );
        check(
            &mut e,
            self.min_rate_factor > 0.0 && self.min_rate_factor <= self.max_rate_factor,
            "rate_limiter.min_rate_factor",
            "must be > 0 and <= max_rate_factor",
        );
        e
    }
}

impl RetryConfig {
    pub fn violations(&self) -> Vec<ValidationError> {
        let mut e = Vec::new();
        check(&mut e, self.max_attempts > 0, "retry.max_attempts", "must be > 0");
        check(
            &mut e,
            self.base_delay_ms <= self.max_delay_ms,
            "retry.base_delay_ms",
            "must not exceed max_delay_ms",
        );
        check(&mut e, self.multiplier >= 1.0, "retry.multiplier", "must be >= 1.0");
        check(&mut e, is_ratio(self.success_threshold), "retry.success_threshold", "must be within 0.0..=1.0");
        check(&mut e, self.adaptive_window > 0, "retry.adaptive_window", "must be > 0");
        e
    }
}

impl LoadBalancerConfig {
    pub fn violations(&self) -> Vec<ValidationError> {
        let mut e = Vec::new();
        check(&mut e, self.max_failures > 0, "load_balancer.max_failures", "must be > 0");
        check(&mut e, self.response_time_window > 0, "load_balancer.response_time_window", "must be > 0");
        check(
            &mut e,
            !self.health_check.enabled || self.health_check.interval_ms > 0,
            "load_balancer.health_check.interval_ms",
            "must be > 0 when health checks are enabled",
        );
        check(
            &mut e,
            self.low_latency_threshold_ms < self.high_latency_threshold_ms,
            "load_balancer.low_latency_threshold_ms",
            "must be below high_latency_threshold_ms",
        );

        let mut seen = HashSet::new();
        for (i, instance) in self.instances.iter().enumerate() {
            if !seen.insert(instance.id.as_str()) {
                e.push(ValidationError::new(
                    format!("load_balancer.instances[{}].id", i),
                    format!("duplicate instance id '{}'", instance.id),
                ));
            }
            if !(instance.weight.is_finite() && instance.weight > 0.0) {
                e.push(ValidationError::new(
                    format!("load_balancer.instances[{}].weight", i),
                    "must be a positive number",
                ));
            }
            if instance.max_connections == 0 {
                e.push(ValidationError::new(
                    format!("load_balancer.instances[{}].max_connections", i),
                    "must be > 0",
                ));
            }
        }
        e
    }
}

impl ManagerConfig {
    pub fn violations(&self) -> Vec<ValidationError> {
        let mut e = Vec::new();
        check(&mut e, !self.name.is_empty(), "manager.name", "must not be empty");
        check(&mut e, self.alert_interval_ms > 0, "manager.alert_interval_ms", "must be > 0");
        check(&mut e, self.alert_history_size > 0, "manager.alert_history_size", "must be > 0");
        check(
            &mut e,
            is_ratio(self.failure_rate_threshold),
            "manager.failure_rate_threshold",
            "must be within 0.0..=1.0",
        );
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::InstanceConfig;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&ReliabilityConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_all_violations() {
        let mut config = ReliabilityConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        config.retry.max_attempts = 0;
        config.load_balancer.instances = vec![
            InstanceConfig {
                id: "a".into(),
                host: "localhost".into(),
                port: 8001,
                weight: 1.0,
                max_connections: 10,
            },
            InstanceConfig {
                id: "a".into(),
                host: "localhost".into(),
                port: 8002,
                weight: 0.0,
                max_connections: 10,
            },
        ];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "circuit_breaker.failure_threshold",
                "retry.max_attempts",
                "load_balancer.instances[1].id",
                "load_balancer.instances[1].weight",
            ]
        );
    }
}
