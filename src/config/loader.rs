//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::ReliabilityConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading and component construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConfigError {
    /// `Ok(())` when `violations` is empty.
    pub fn check(violations: Vec<ValidationError>) -> Result<(), ConfigError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(violations))
        }
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ReliabilityConfig, ConfigError> {
    let config: ReliabilityConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ReliabilityConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::LoadBalancingAlgorithm;
    use crate::rate_limit::RateLimitStrategy;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = parse_config(
            r#"
            [circuit_breaker]
            failure_threshold = 2

            [rate_limiter]
            strategy = "token_bucket"

            [load_balancer]
            algorithm = "weighted_round_robin"

            [[load_balancer.instances]]
            id = "a"
            host = "10.0.0.1"
            port = 8080
            weight = 2.0
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.rate_limiter.strategy, RateLimitStrategy::TokenBucket);
        assert_eq!(config.load_balancer.algorithm, LoadBalancingAlgorithm::WeightedRoundRobin);
        assert_eq!(config.load_balancer.instances[0].max_connections, 100);
        assert_eq!(config.manager.name, "default");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse_config("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("retry.max_attempts"));

        assert!(matches!(parse_config("[retry\n"), Err(ConfigError::Parse(_))));
    }
}
