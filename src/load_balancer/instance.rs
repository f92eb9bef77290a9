//! Instance abstraction.
//!
//! # Responsibilities
//! - Represent a single named target (host, port, weight)
//! - Track active connections and enforce the connection limit
//! - Keep request counters and a bounded response-time window
//! - Carry the health status consulted by every selection algorithm

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::InstanceConfig;
use crate::resilience::window::RingBuffer;

/// Default number of response times kept per instance.
pub const DEFAULT_RESPONSE_TIME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    /// Finishing in-flight work; receives no new selections.
    Draining,
    Maintenance,
}

/// A single target instance and its live statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Relative weight for weighted algorithms. Always > 0.
    pub weight: f64,
    pub max_connections: u32,
    pub status: InstanceStatus,
    pub current_connections: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_health_check: Option<Instant>,
    /// Last failed request or failed health check.
    #[serde(skip)]
    pub last_failure: Option<Instant>,
    #[serde(skip)]
    response_times: RingBuffer<Duration>,
}

impl Instance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: 1.0,
            max_connections: 100,
            status: InstanceStatus::Healthy,
            current_connections: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            last_health_check: None,
            last_failure: None,
            response_times: RingBuffer::new(DEFAULT_RESPONSE_TIME_WINDOW),
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(config.id.clone(), config.host.clone(), config.port)
            .with_weight(config.weight)
            .with_max_connections(config.max_connections)
    }

    /// Non-positive or non-finite weights fall back to 1.0.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = if weight.is_finite() && weight > 0.0 { weight } else { 1.0 };
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_response_time_window(mut self, capacity: usize) -> Self {
        self.response_times = RingBuffer::new(capacity);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Mean of recorded response times, zero when none were recorded.
    pub fn average_response_time(&self) -> Duration {
        self.response_times.mean().unwrap_or(Duration::ZERO)
    }

    pub fn has_response_times(&self) -> bool {
        !self.response_times.is_empty()
    }

    /// 1.0 until the first request completes.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_requests + self.failed_requests;
        if completed == 0 {
            1.0
        } else {
            self.successful_requests as f64 / completed as f64
        }
    }

    pub fn load_factor(&self) -> f64 {
        f64::from(self.current_connections) / f64::from(self.max_connections)
    }

    /// Healthy and below its connection limit.
    pub fn is_available(&self) -> bool {
        self.status == InstanceStatus::Healthy && self.current_connections < self.max_connections
    }

    /// Count a completed request. Health transitions are applied separately.
    pub fn record_response(&mut self, response_time: Duration, success: bool, now: Instant) {
        self.response_times.push(response_time);
        if success {
            self.successful_requests += 1;
            self.consecutive_failures = 0;
        } else {
            self.failed_requests += 1;
            self.consecutive_failures += 1;
            self.last_failure = Some(now);
        }
    }

    pub(crate) fn clear_stats(&mut self) {
        self.total_requests = 0;
        self.successful_requests = 0;
        self.failed_requests = 0;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.last_health_check = None;
        self.response_times.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values() {
        let mut inst = Instance::new("a", "10.0.0.1", 8080).with_max_connections(4);
        assert_eq!(inst.success_rate(), 1.0);
        assert_eq!(inst.average_response_time(), Duration::ZERO);
        assert!(inst.is_available());

        let now = Instant::now();
        inst.record_response(Duration::from_millis(100), true, now);
        inst.record_response(Duration::from_millis(300), false, now);
        assert_eq!(inst.success_rate(), 0.5);
        assert_eq!(inst.average_response_time(), Duration::from_millis(200));
        assert_eq!(inst.consecutive_failures, 1);

        inst.current_connections = 4;
        assert_eq!(inst.load_factor(), 1.0);
        assert!(!inst.is_available());
    }

    #[test]
    fn test_invalid_weight_falls_back() {
        assert_eq!(Instance::new("a", "h", 1).with_weight(0.0).weight, 1.0);
        assert_eq!(Instance::new("a", "h", 1).with_weight(2.5).weight, 2.5);
    }
}
