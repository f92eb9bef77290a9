//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Unit of work:
//!     → circuit_breaker.rs (admit, enforce timeout, record outcome)
//!     → retry.rs (classify failure, back off, try again)
//!         → classify.rs (error → ErrorKind)
//!         → backoff.rs (attempt + kind → delay)
//! ```
//!
//! The breaker wraps the retry loop, so one logical call is one breaker outcome.

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod retry;
pub mod window;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use classify::ErrorClassifier;
pub use retry::{OperationRecord, RetryHandler, RetryMetrics};
pub use window::RingBuffer;
