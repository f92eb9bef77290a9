//! Configuration schema definitions.
//!
//! Every section derives Serde traits and falls back to defaults field by
//! field, so a config file only needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::load_balancer::LoadBalancingAlgorithm;
use crate::rate_limit::RateLimitStrategy;
use crate::resilience::backoff::BackoffStrategy;

/// Root configuration for a reliability manager.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub retry: RetryConfig,
    pub load_balancer: LoadBalancerConfig,
    pub manager: ManagerConfig,
    pub observability: ObservabilityConfig,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Consecutive failures (while closed) that open the circuit.
    pub failure_threshold: u32,

    /// Successful probes (while half-open) that close the circuit.
    pub success_threshold: u32,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Time spent open before a probe is allowed, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Probes admitted per half-open episode.
    pub half_open_max_calls: u32,

    /// Capacity of the outcome and duration windows.
    pub sliding_window_size: usize,

    /// Samples required before the rate-based open conditions apply.
    pub minimum_throughput: usize,

    /// Failure ratio (0.0..=1.0) that opens the circuit.
    pub failure_rate_threshold: f64,

    /// Calls slower than this count as slow, in milliseconds.
    pub slow_call_duration_threshold_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 3,
            sliding_window_size: 100,
            minimum_throughput: 10,
            failure_rate_threshold: 0.5,
            slow_call_duration_threshold_ms: 5_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn slow_call_duration_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold_ms)
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,

    pub strategy: RateLimitStrategy,

    /// Token bucket refill rate before the adaptive factor is applied.
    pub requests_per_second: f64,

    /// Token bucket capacity.
    pub burst_size: u32,

    /// Sliding window length in milliseconds.
    pub window_ms: u64,

    /// Requests admitted per sliding window.
    pub max_requests: usize,

    /// Queue denied callers instead of rejecting them.
    pub enable_queue: bool,

    pub max_queue_size: usize,

    /// Default wait deadline for queued callers, in milliseconds.
    pub queue_timeout_ms: u64,

    /// Minimum spacing between adaptive rate adjustments, in milliseconds.
    pub adjustment_interval_ms: u64,

    pub min_rate_factor: f64,
    pub max_rate_factor: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::Adaptive,
            requests_per_second: 100.0,
            burst_size: 200,
            window_ms: 1_000,
            max_requests: 100,
            enable_queue: true,
            max_queue_size: 1_000,
            queue_timeout_ms: 5_000,
            adjustment_interval_ms: 10_000,
            min_rate_factor: 0.1,
            max_rate_factor: 2.0,
        }
    }
}

impl RateLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.adjustment_interval_ms)
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,

    pub multiplier: f64,

    /// Apply ±10% jitter to every delay.
    pub jitter: bool,

    pub strategy: BackoffStrategy,

    /// Recent success rate above which adaptive backoff shortens delays.
    pub success_threshold: f64,

    /// Number of recent logical calls the success rate is computed over.
    pub adaptive_window: usize,

    /// Number of operation records kept for inspection.
    pub history_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            strategy: BackoffStrategy::Exponential,
            success_threshold: 0.8,
            adaptive_window: 20,
            history_size: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub enabled: bool,

    pub algorithm: LoadBalancingAlgorithm,

    pub health_check: HealthCheckConfig,

    /// Consecutive failed releases that mark a healthy instance unhealthy.
    pub max_failures: u32,

    /// Minimum time since the last failure before an instance may recover.
    pub recovery_time_ms: u64,

    /// Response times kept per instance.
    pub response_time_window: usize,

    /// Minimum spacing between adaptive algorithm re-evaluations.
    pub adaptation_interval_ms: u64,

    pub high_latency_threshold_ms: u64,
    pub low_latency_threshold_ms: u64,

    /// Instances registered at construction.
    pub instances: Vec<InstanceConfig>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            health_check: HealthCheckConfig::default(),
            max_failures: 3,
            recovery_time_ms: 30_000,
            response_time_window: 100,
            adaptation_interval_ms: 30_000,
            high_latency_threshold_ms: 2_000,
            low_latency_threshold_ms: 100,
            instances: Vec::new(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_millis(self.adaptation_interval_ms)
    }

    pub fn high_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.high_latency_threshold_ms)
    }

    pub fn low_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.low_latency_threshold_ms)
    }
}

/// Periodic health check settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    /// Health check interval in milliseconds.
    pub interval_ms: u64,

    /// Per-callback timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A backend instance known at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Unique instance identifier.
    pub id: String,

    pub host: String,

    pub port: u16,

    /// Relative weight for weighted algorithms (default: 1.0).
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Maximum concurrent connections to this instance.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_connections() -> u32 {
    100
}

/// Manager-level alerting thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Name used in logs, metrics labels, and admission errors.
    pub name: String,

    /// Alert evaluation interval in milliseconds.
    pub alert_interval_ms: u64,

    pub alert_history_size: usize,

    /// Overall failure rate that raises an alert.
    pub failure_rate_threshold: f64,

    /// Mean response time that raises an alert, in milliseconds.
    pub response_time_threshold_ms: u64,

    /// Circuit openings (since the last reset) that raise an alert.
    pub circuit_open_threshold: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            alert_interval_ms: 30_000,
            alert_history_size: 1_000,
            failure_rate_threshold: 0.1,
            response_time_threshold_ms: 5_000,
            circuit_open_threshold: 1,
        }
    }
}

impl ManagerConfig {
    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }

    pub fn response_time_threshold(&self) -> Duration {
        Duration::from_millis(self.response_time_threshold_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Install the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
