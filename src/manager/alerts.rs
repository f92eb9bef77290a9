//! Health score and threshold alerts.

use serde::Serialize;
use std::time::Duration;

use crate::config::ManagerConfig;
use crate::observability::unix_millis;
use crate::resilience::CircuitState;

/// A threshold breach at least this many times over is critical.
const CRITICAL_MULTIPLE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighFailureRate,
    SlowResponses,
    CircuitOpen,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighFailureRate => "high_failure_rate",
            AlertKind::SlowResponses => "slow_responses",
            AlertKind::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    /// Observed value and the threshold it crossed, in the metric's own unit.
    pub value: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
}

/// What one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct AlertInputs {
    /// `None` until at least one request has completed.
    pub failure_rate: Option<f64>,
    pub mean_response_time: Option<Duration>,
    pub circuit_open_count: u64,
    pub circuit_state: Option<CircuitState>,
}

fn severity(value: f64, threshold: f64) -> Severity {
    if value >= threshold * CRITICAL_MULTIPLE {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Evaluate every threshold; returns the alerts that currently apply.
pub fn evaluate(inputs: &AlertInputs, config: &ManagerConfig) -> Vec<Alert> {
    let now = unix_millis();
    let mut alerts = Vec::new();

    if let Some(rate) = inputs.failure_rate {
        let threshold = config.failure_rate_threshold;
        if rate > threshold {
            alerts.push(Alert {
                kind: AlertKind::HighFailureRate,
                severity: severity(rate, threshold),
                message: format!("failure rate {:.1}% exceeds {:.1}%", rate * 100.0, threshold * 100.0),
                value: rate,
                threshold,
                timestamp_ms: now,
            });
        }
    }

    if let Some(mean) = inputs.mean_response_time {
        let threshold = config.response_time_threshold();
        if mean > threshold {
            let (value, limit) = (mean.as_secs_f64() * 1000.0, threshold.as_secs_f64() * 1000.0);
            alerts.push(Alert {
                kind: AlertKind::SlowResponses,
                severity: severity(value, limit),
                message: format!("mean response time {:.0}ms exceeds {:.0}ms", value, limit),
                value,
                threshold: limit,
                timestamp_ms: now,
            });
        }
    }

    if config.circuit_open_threshold > 0 && inputs.circuit_open_count >= config.circuit_open_threshold {
        let (value, limit) = (inputs.circuit_open_count as f64, config.circuit_open_threshold as f64);
        let severity = if inputs.circuit_state == Some(CircuitState::Open) {
            Severity::Critical
        } else {
            severity(value, limit)
        };
        alerts.push(Alert {
            kind: AlertKind::CircuitOpen,
            severity,
            message: format!(
                "circuit opened {} time(s), currently {}",
                inputs.circuit_open_count,
                inputs
                    .circuit_state
                    .map(|s| s.as_str())
                    .unwrap_or("unknown")
            ),
            value,
            threshold: limit,
            timestamp_ms: now,
        });
    }

    alerts
}

/// Mean of three sub-scores in `0.0..=1.0`:
/// `1 - failure_rate`, response time (1.0 up to one second, then `1 / secs`),
/// and breaker (0.5 while open).
pub fn health_score(failure_rate: f64, mean_response_time: Option<Duration>, breaker_open: bool) -> f64 {
    let failure_score = (1.0 - failure_rate).clamp(0.0, 1.0);
    let response_score = match mean_response_time {
        Some(mean) if mean > Duration::from_secs(1) => 1.0 / mean.as_secs_f64(),
        _ => 1.0,
    };
    let breaker_score = if breaker_open { 0.5 } else { 1.0 };
    (failure_score + response_score + breaker_score) / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score() {
        assert_eq!(health_score(0.0, None, false), 1.0);
        assert_eq!(health_score(0.0, Some(Duration::from_millis(900)), false), 1.0);
        let score = health_score(0.5, Some(Duration::from_secs(2)), true);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_alert_thresholds_and_severity() {
        let config = ManagerConfig {
            failure_rate_threshold: 0.1,
            response_time_threshold_ms: 1_000,
            circuit_open_threshold: 1,
            ..Default::default()
        };

        let quiet = AlertInputs {
            failure_rate: Some(0.05),
            mean_response_time: Some(Duration::from_millis(200)),
            circuit_open_count: 0,
            circuit_state: Some(CircuitState::Closed),
        };
        assert!(evaluate(&quiet, &config).is_empty());

        let noisy = AlertInputs {
            failure_rate: Some(0.15),
            mean_response_time: Some(Duration::from_millis(2_500)),
            circuit_open_count: 1,
            circuit_state: Some(CircuitState::Open),
        };
        let alerts = evaluate(&noisy, &config);
        let summary: Vec<_> = alerts.iter().map(|a| (a.kind, a.severity)).collect();
        assert_eq!(
            summary,
            vec![
                (AlertKind::HighFailureRate, Severity::Warning),
                (AlertKind::SlowResponses, Severity::Critical),
                (AlertKind::CircuitOpen, Severity::Critical),
            ]
        );
    }
}
