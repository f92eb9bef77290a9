//! Error taxonomy shared by every component.
//!
//! # Categories
//! - Admission denial: rate limited, no instance available. Expected outcomes.
//! - Execution failure: the unit of work failed or timed out.
//! - Protection exhausted: circuit open with no fallback, retries exhausted.
//! - Fallback failure: the fallback itself failed.
//!
//! Callers branch on [`ReliabilityError::category`], never on message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type ReliabilityResult<T> = Result<T, ReliabilityError>;

/// Retry classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
    RateLimited,
    Timeout,
    Network,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::NonRetryable => "non_retryable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::ServerError => "server_error",
        }
    }

    /// Everything except `NonRetryable` may be retried.
    pub fn is_retryable(&self) -> bool {
        *self != ErrorKind::NonRetryable
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse failure category for caller-side branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AdmissionDenied,
    ExecutionFailed,
    ProtectionExhausted,
    FallbackFailed,
}

/// An error raised by a unit of work that carries its own classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }
}

/// Errors surfaced by the reliability components.
#[derive(Debug, Error)]
pub enum ReliabilityError {
    /// Admission denied by the rate limiter.
    #[error("rate limit exceeded for '{resource}'")]
    RateLimited { resource: String },

    /// The load balancer had no available instance. Retryable by the caller.
    #[error("no instance available for '{resource}'")]
    NoInstanceAvailable { resource: String },

    /// The circuit breaker rejected the call and no fallback was supplied.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The wrapped call exceeded its deadline and was abandoned.
    #[error("call through '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// All attempts failed; carries the last underlying cause.
    #[error("retries exhausted after {attempts} attempts ({last_kind})")]
    RetriesExhausted {
        attempts: u32,
        last_kind: ErrorKind,
        #[source]
        source: Box<ReliabilityError>,
    },

    /// The fallback itself failed.
    #[error("fallback failed: {0}")]
    FallbackFailed(#[source] BoxError),

    /// The original error returned by the unit of work.
    #[error("{0}")]
    Operation(#[source] BoxError),
}

impl ReliabilityError {
    /// Wrap any error produced by a unit of work.
    pub fn operation(error: impl Into<BoxError>) -> Self {
        ReliabilityError::Operation(error.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ReliabilityError::RateLimited { .. } | ReliabilityError::NoInstanceAvailable { .. } => {
                ErrorCategory::AdmissionDenied
            }
            ReliabilityError::Timeout { .. } | ReliabilityError::Operation(_) => {
                ErrorCategory::ExecutionFailed
            }
            ReliabilityError::CircuitOpen { .. } | ReliabilityError::RetriesExhausted { .. } => {
                ErrorCategory::ProtectionExhausted
            }
            ReliabilityError::FallbackFailed(_) => ErrorCategory::FallbackFailed,
        }
    }

    pub fn is_admission_denial(&self) -> bool {
        self.category() == ErrorCategory::AdmissionDenied
    }

    /// Borrow the unit of work's original error, if this is one.
    pub fn as_operation_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ReliabilityError::Operation(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<BoxError> for ReliabilityError {
    fn from(error: BoxError) -> Self {
        ReliabilityError::Operation(error)
    }
}

impl From<ClassifiedError> for ReliabilityError {
    fn from(error: ClassifiedError) -> Self {
        ReliabilityError::Operation(Box::new(error))
    }
}

impl From<std::io::Error> for ReliabilityError {
    fn from(error: std::io::Error) -> Self {
        ReliabilityError::Operation(Box::new(error))
    }
}
