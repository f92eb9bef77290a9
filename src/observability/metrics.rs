//! Metrics collection and exposition.
//!
//! # Metrics
//! - `reliability_circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `reliability_circuit_calls_total` (counter): by breaker, outcome
//! - `reliability_rate_limit_decisions_total` (counter): by limiter, decision
//! - `reliability_rate_limit_queue_depth` (gauge)
//! - `reliability_rate_limit_factor` (gauge): adaptive rate factor
//! - `reliability_retry_attempts_total` (counter): by handler, outcome
//! - `reliability_instance_health` (gauge): 1=healthy, 0=not
//! - `reliability_instance_selections_total` (counter)
//! - `reliability_requests_total` (counter) and `reliability_request_duration_seconds` (histogram)
//! - `reliability_health_score` (gauge)
//! - `reliability_alerts_total` (counter): by kind, severity

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::resilience::CircuitState;

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_circuit_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("reliability_circuit_state", "breaker" => breaker.to_string()).set(value);
}

pub fn record_circuit_call(breaker: &str, outcome: &'static str) {
    counter!(
        "reliability_circuit_calls_total",
        "breaker" => breaker.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_rate_limit(limiter: &str, decision: &'static str) {
    counter!(
        "reliability_rate_limit_decisions_total",
        "limiter" => limiter.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn record_queue_depth(limiter: &str, depth: usize) {
    gauge!("reliability_rate_limit_queue_depth", "limiter" => limiter.to_string()).set(depth as f64);
}

pub fn record_rate_factor(limiter: &str, factor: f64) {
    gauge!("reliability_rate_limit_factor", "limiter" => limiter.to_string()).set(factor);
}

/// `failure` is `None` for a successful attempt.
pub fn record_retry_attempt(handler: &str, failure: Option<ErrorKind>) {
    let outcome = failure.map(|k| k.as_str()).unwrap_or("success");
    counter!(
        "reliability_retry_attempts_total",
        "handler" => handler.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_instance_health(balancer: &str, instance: &str, healthy: bool) {
    gauge!(
        "reliability_instance_health",
        "balancer" => balancer.to_string(),
        "instance" => instance.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_instance_selected(balancer: &str, instance: &str) {
    counter!(
        "reliability_instance_selections_total",
        "balancer" => balancer.to_string(),
        "instance" => instance.to_string()
    )
    .increment(1);
}

pub fn record_request(manager: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "reliability_requests_total",
        "manager" => manager.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("reliability_request_duration_seconds", "manager" => manager.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_health_score(manager: &str, score: f64) {
    gauge!("reliability_health_score", "manager" => manager.to_string()).set(score);
}

pub fn record_alert(manager: &str, kind: &'static str, severity: &'static str) {
    counter!(
        "reliability_alerts_total",
        "manager" => manager.to_string(),
        "kind" => kind,
        "severity" => severity
    )
    .increment(1);
}
