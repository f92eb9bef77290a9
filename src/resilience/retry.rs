//! Bounded retry with classified errors and strategy-driven backoff.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, RetryConfig};
use crate::error::{ErrorKind, ReliabilityError, ReliabilityResult};
use crate::observability::{metrics, unix_millis};
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::classify::ErrorClassifier;
use crate::resilience::window::RingBuffer;

/// One logical call, however many attempts it took.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub attempts: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub last_error: Option<ErrorKind>,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryMetrics {
    pub name: String,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_attempts: u64,
    pub total_retries: u64,
    pub average_attempts: f64,
    pub success_rate: f64,
    /// Success rate over the adaptive window; 1.0 when empty.
    pub recent_success_rate: f64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

#[derive(Debug)]
struct RetryState {
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    total_attempts: u64,
    total_retries: u64,
    errors_by_kind: BTreeMap<ErrorKind, u64>,
    recent: RingBuffer<bool>,
    history: RingBuffer<OperationRecord>,
}

impl RetryState {
    fn new(config: &RetryConfig) -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            total_attempts: 0,
            total_retries: 0,
            errors_by_kind: BTreeMap::new(),
            recent: RingBuffer::new(config.adaptive_window),
            history: RingBuffer::new(config.history_size),
        }
    }
}

/// Retries a unit of work according to its error classification.
#[derive(Debug)]
pub struct RetryHandler {
    name: String,
    config: RetryConfig,
    policy: BackoffPolicy,
    classifier: ErrorClassifier,
    state: Mutex<RetryState>,
}

impl RetryHandler {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        ConfigError::check(config.violations())?;
        let policy = BackoffPolicy {
            strategy: config.strategy,
            base: config.base_delay(),
            max: config.max_delay(),
            multiplier: config.multiplier,
            jitter: config.jitter,
        };
        Ok(Self {
            name: name.into(),
            state: Mutex::new(RetryState::new(&config)),
            policy,
            config,
            classifier: ErrorClassifier::default(),
        })
    }

    /// Replace the classifier.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register extra type or keyword rules before the handler is shared.
    pub fn classifier_mut(&mut self) -> &mut ErrorClassifier {
        &mut self.classifier
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// Non-retryable errors are returned unchanged after the first attempt
    /// that produced them. Running out of attempts yields
    /// [`ReliabilityError::RetriesExhausted`] carrying the last error.
    pub async fn execute_with_retry<T, F, Fut, E>(&self, mut op: F) -> ReliabilityResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    self.record_attempt(None);
                    self.finish(attempt, started, None);
                    return Ok(value);
                }
                Err(e) => e.into(),
            };

            let kind = self.classifier.classify(&err);
            self.record_attempt(Some(kind));

            if !kind.is_retryable() {
                tracing::debug!(handler = %self.name, attempt, error = %err, "Non-retryable error");
                self.finish(attempt, started, Some(kind));
                return Err(err);
            }

            if attempt >= self.config.max_attempts {
                tracing::warn!(
                    handler = %self.name,
                    attempts = attempt,
                    kind = %kind,
                    error = %err,
                    "Retries exhausted"
                );
                self.finish(attempt, started, Some(kind));
                return Err(ReliabilityError::RetriesExhausted {
                    attempts: attempt,
                    last_kind: kind,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay(attempt, kind, self.recently_healthy());
            tracing::debug!(
                handler = %self.name,
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Retrying after delay"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay that would precede the retry after `attempt` failed with `kind`.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> Duration {
        self.policy.delay(attempt, kind, self.recently_healthy())
    }

    fn recently_healthy(&self) -> bool {
        let rate = self.state.lock().recent.ratio_of(true).unwrap_or(1.0);
        rate > self.config.success_threshold
    }

    fn record_attempt(&self, failure: Option<ErrorKind>) {
        let mut state = self.state.lock();
        state.total_attempts += 1;
        if let Some(kind) = failure {
            *state.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
        drop(state);
        metrics::record_retry_attempt(&self.name, failure);
    }

    fn finish(&self, attempts: u32, started: Instant, last_error: Option<ErrorKind>) {
        let success = last_error.is_none();
        let mut state = self.state.lock();
        state.total_operations += 1;
        state.total_retries += u64::from(attempts.saturating_sub(1));
        if success {
            state.successful_operations += 1;
        } else {
            state.failed_operations += 1;
        }
        state.recent.push(success);
        state.history.push(OperationRecord {
            attempts,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            last_error,
            finished_at_ms: unix_millis(),
        });
    }

    /// Up to `n` most recent operation records, newest first.
    pub fn recent_history(&self, n: usize) -> Vec<OperationRecord> {
        self.state.lock().history.iter().rev().take(n).cloned().collect()
    }

    pub fn get_metrics(&self) -> RetryMetrics {
        let state = self.state.lock();
        let ops = state.total_operations;
        RetryMetrics {
            name: self.name.clone(),
            total_operations: ops,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            total_attempts: state.total_attempts,
            total_retries: state.total_retries,
            average_attempts: if ops == 0 { 0.0 } else { state.total_attempts as f64 / ops as f64 },
            success_rate: if ops == 0 { 1.0 } else { state.successful_operations as f64 / ops as f64 },
            recent_success_rate: state.recent.ratio_of(true).unwrap_or(1.0),
            errors_by_kind: state.errors_by_kind.clone(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = RetryState::new(&self.config);
        tracing::info!(handler = %self.name, "Retry handler reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifiedError;
    use crate::resilience::backoff::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler(max_attempts: u32) -> RetryHandler {
        RetryHandler::new(
            "test",
            RetryConfig {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter: false,
                strategy: BackoffStrategy::Fixed,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let h = handler(3);
        let calls = AtomicU32::new(0);
        let value = h
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClassifiedError::new(ErrorKind::Network, "connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        let m = h.get_metrics();
        assert_eq!(m.total_attempts, 3);
        assert_eq!(m.total_retries, 2);
        assert_eq!(m.errors_by_kind.get(&ErrorKind::Network), Some(&2));
        assert!(h.recent_history(1)[0].success);
    }

    #[tokio::test]
    async fn test_exhaustion_carries_last_error() {
        let h = handler(3);
        let calls = AtomicU32::new(0);
        let err = h
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClassifiedError::retryable("still failing")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ReliabilityError::RetriesExhausted { attempts, last_kind, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_kind, ErrorKind::Retryable);
                assert_eq!(source.to_string(), "still failing");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.get_metrics().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_original_error() {
        let h = handler(5);
        let calls = AtomicU32::new(0);
        let err = h
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClassifiedError::non_retryable("invalid order")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let inner = err.as_operation_error().unwrap();
        assert!(inner.downcast_ref::<ClassifiedError>().is_some());
    }

    #[tokio::test]
    async fn test_custom_rule_via_classifier_mut() {
        #[derive(Debug, thiserror::Error)]
        #[error("insufficient funds")]
        struct InsufficientFunds;

        let mut h = handler(4);
        h.classifier_mut().register_type::<InsufficientFunds>(ErrorKind::NonRetryable);

        let calls = AtomicU32::new(0);
        let _ = h
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ReliabilityError::operation(InsufficientFunds)) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_adaptive_delay_follows_recent_success() {
        let h = RetryHandler::new(
            "adaptive",
            RetryConfig {
                base_delay_ms: 100,
                jitter: false,
                strategy: BackoffStrategy::Adaptive,
                success_threshold: 0.5,
                ..Default::default()
            },
        )
        .unwrap();

        // Empty window counts as healthy.
        assert_eq!(h.next_delay(2, ErrorKind::Retryable), Duration::from_millis(100));
        for _ in 0..3 {
            h.finish(1, Instant::now(), Some(ErrorKind::Retryable));
        }
        assert_eq!(h.next_delay(2, ErrorKind::Retryable), Duration::from_millis(400));
    }
}
