//! Reliability toolkit for calls to remote dependencies.
//!
//! Circuit breaking, rate limiting, retries with backoff and instance
//! load balancing, composed by [`ReliabilityManager`].

// Building blocks
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod resilience;

// Traffic management
pub mod health;
pub mod load_balancer;

// Orchestration
pub mod manager;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ReliabilityConfig;
pub use error::{BoxError, ClassifiedError, ErrorKind, ReliabilityError, ReliabilityResult};
pub use lifecycle::Shutdown;
pub use manager::{ManagerMetrics, ReliabilityManager};
pub use rate_limit::Priority;
