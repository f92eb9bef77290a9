//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ReliabilityConfig (validated, immutable)
//!     → each component takes its own section at construction
//! ```
//!
//! All fields have defaults so minimal files work. Components re-validate
//! their own section when built directly, without going through the loader.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CircuitBreakerConfig, HealthCheckConfig, InstanceConfig, LoadBalancerConfig, LogFormat,
    ManagerConfig, ObservabilityConfig, RateLimiterConfig, ReliabilityConfig, RetryConfig,
};
pub use validation::{validate_config, ValidationError};
