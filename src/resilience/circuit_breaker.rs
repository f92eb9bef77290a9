//! Circuit breaker with count, rate and slow-call trip conditions.
//!
//! # States
//! - Closed: calls pass through, outcomes are recorded
//! - Open: calls fail fast (or take the fallback)
//! - Half-Open: a bounded number of probes test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:      consecutive failures >= failure_threshold
//!                     or failure rate >= failure_rate_threshold (with minimum throughput)
//!                     or >= 50% slow calls (with minimum throughput)
//! Open → Half-Open:   first call after recovery_timeout
//! Half-Open → Closed: success_threshold probes succeeded
//! Half-Open → Open:   any probe failed, or every admitted probe finished short of the threshold
//! ```
//!
//! Outcomes are recorded in one critical section after the call completes.
//! A call dropped mid-flight records nothing; its half-open slot is returned
//! by [`ProbePermit`].

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::{Future, Ready};
use std::time::{Duration, Instant};
use tokio::time;

use crate::config::{CircuitBreakerConfig, ConfigError};
use crate::error::{BoxError, ReliabilityError, ReliabilityResult};
use crate::observability::metrics;
use crate::resilience::window::RingBuffer;

/// Fraction of slow calls in the window that trips the breaker.
const SLOW_CALL_RATE_THRESHOLD: f64 = 0.5;

/// Fallback type used when the caller supplies none.
type NoFallback<T> = fn() -> Ready<Result<T, BoxError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    pub fallback_calls: u64,
    pub circuit_open_count: u64,
    /// Failure ratio over the outcome window, 0.0 when empty.
    pub failure_rate: f64,
    /// Slow-call ratio over the duration window, 0.0 when empty.
    pub slow_call_rate: f64,
    pub average_response_time_ms: f64,
    /// Milliseconds since the last failure, if any.
    pub last_failure_ago_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Consecutive failures while closed.
    failure_count: u32,
    /// Successful probes in the current half-open episode.
    success_count: u32,
    /// Probes admitted in the current half-open episode.
    half_open_calls: u32,
    /// Admitted probes that have not completed yet.
    half_open_in_flight: u32,
    /// Bumped on every transition; stale permits are ignored.
    episode: u64,
    opened_at: Option<Instant>,
    last_failure_time: Option<Instant>,
    outcomes: RingBuffer<bool>,
    durations: RingBuffer<Duration>,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    timeouts: u64,
    fallback_calls: u64,
    circuit_open_count: u64,
}

impl Inner {
    fn new(window: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            half_open_in_flight: 0,
            episode: 0,
            opened_at: None,
            last_failure_time: None,
            outcomes: RingBuffer::new(window),
            durations: RingBuffer::new(window),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            timeouts: 0,
            fallback_calls: 0,
            circuit_open_count: 0,
        }
    }
}

enum Admission<'a> {
    Closed,
    Probe(ProbePermit<'a>),
    Rejected,
}

/// A reserved half-open probe slot.
///
/// Dropping an armed permit (the call was cancelled) returns the slot without
/// recording an outcome.
#[must_use]
pub struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    episode: u64,
    armed: bool,
}

impl ProbePermit<'_> {
    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.episode
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.episode == self.episode && inner.state == CircuitState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            tracing::debug!(breaker = %self.breaker.name, "Half-open probe cancelled, slot returned");
        }
    }
}

/// Three-state circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        ConfigError::check(config.violations())?;
        let name = name.into();
        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout_ms,
            "Circuit breaker created"
        );
        Ok(Self {
            inner: Mutex::new(Inner::new(config.sliding_window_size)),
            name,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the Open → Half-Open check.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `op` through the breaker.
    ///
    /// Rejections return [`ReliabilityError::CircuitOpen`]; failures return the
    /// operation's own error (or [`ReliabilityError::Timeout`]).
    pub async fn call<T, F, Fut, E>(&self, op: F) -> ReliabilityResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
    {
        self.execute(op, None::<NoFallback<T>>).await
    }

    /// Run `op` through the breaker, answering rejections and failures with `fallback`.
    pub async fn call_with_fallback<T, F, Fut, E, FB, FFut, GE>(
        &self,
        op: F,
        fallback: FB,
    ) -> ReliabilityResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        self.execute(op, Some(fallback)).await
    }

    async fn execute<T, F, Fut, E, FB, FFut, GE>(
        &self,
        op: F,
        fallback: Option<FB>,
    ) -> ReliabilityResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        let permit = match self.admit() {
            Admission::Closed => None,
            Admission::Probe(permit) => Some(permit),
            Admission::Rejected => {
                metrics::record_circuit_call(&self.name, "rejected");
                return match fallback {
                    Some(fb) => self.run_fallback(fb).await,
                    None => Err(ReliabilityError::CircuitOpen {
                        name: self.name.clone(),
                    }),
                };
            }
        };

        let limit = self.config.timeout();
        let started = Instant::now();
        let result = time::timeout(limit, op()).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ReliabilityError::Timeout {
                name: self.name.clone(),
                after: limit,
            }),
        };

        let episode = permit.map(ProbePermit::disarm);
        match outcome {
            Ok(value) => {
                self.on_success(elapsed, episode);
                metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(err) => {
                let timed_out = matches!(err, ReliabilityError::Timeout { .. });
                self.on_failure(elapsed, timed_out, episode);
                metrics::record_circuit_call(&self.name, if timed_out { "timeout" } else { "failure" });
                tracing::debug!(breaker = %self.name, error = %err, "Call failed");
                match fallback {
                    Some(fb) => self.run_fallback(fb).await,
                    None => Err(err),
                }
            }
        }
    }

    async fn run_fallback<T, FB, FFut, GE>(&self, fallback: FB) -> ReliabilityResult<T>
    where
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        self.inner.lock().fallback_calls += 1;
        metrics::record_circuit_call(&self.name, "fallback");
        fallback()
            .await
            .map_err(|e| ReliabilityError::FallbackFailed(e.into()))
    }

    fn admit(&self) -> Admission<'_> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if elapsed < self.config.recovery_timeout() {
                inner.rejected_calls += 1;
                return Admission::Rejected;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Admission::Closed,
            CircuitState::HalfOpen if inner.half_open_calls < self.config.half_open_max_calls => {
                inner.half_open_calls += 1;
                inner.half_open_in_flight += 1;
                Admission::Probe(ProbePermit {
                    breaker: self,
                    episode: inner.episode,
                    armed: true,
                })
            }
            _ => {
                // Half-open with every probe slot used. If none are still running
                // the episode ended without reaching the success threshold.
                if inner.state == CircuitState::HalfOpen && inner.half_open_in_flight == 0 {
                    self.transition(&mut inner, CircuitState::Open);
                }
                inner.rejected_calls += 1;
                Admission::Rejected
            }
        }
    }

    fn on_success(&self, elapsed: Duration, probe_episode: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        inner.outcomes.push(true);
        inner.durations.push(elapsed);

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if probe_episode == Some(inner.episode) => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                } else if inner.half_open_calls >= self.config.half_open_max_calls
                    && inner.half_open_in_flight == 0
                {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, elapsed: Duration, timed_out: bool, probe_episode: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        if timed_out {
            inner.timeouts += 1;
        }
        inner.last_failure_time = Some(Instant::now());
        inner.outcomes.push(false);
        inner.durations.push(elapsed);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if let Some(reason) = self.trip_reason(&inner) {
                    tracing::warn!(breaker = %self.name, reason, "Trip condition met");
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe_episode == Some(inner.episode) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn trip_reason(&self, inner: &Inner) -> Option<&'static str> {
        let min = self.config.minimum_throughput;

        if inner.failure_count >= self.config.failure_threshold {
            return Some("consecutive failures");
        }
        if inner.outcomes.len() >= min {
            if let Some(rate) = inner.outcomes.ratio_of(false) {
                if rate >= self.config.failure_rate_threshold {
                    return Some("failure rate");
                }
            }
        }
        if inner.durations.len() >= min {
            let slow = self.config.slow_call_duration_threshold();
            if let Some(rate) = inner.durations.ratio_above(slow) {
                if rate >= SLOW_CALL_RATE_THRESHOLD {
                    return Some("slow calls");
                }
            }
        }
        None
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.episode += 1;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.circuit_open_count += 1;
                tracing::warn!(breaker = %self.name, from = %from, to = %to, "Circuit opened");
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit half-open, probing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.outcomes.clear();
                inner.durations.clear();
                tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit closed");
            }
        }
        metrics::record_circuit_state(&self.name, to);
    }

    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            timeouts: inner.timeouts,
            fallback_calls: inner.fallback_calls,
            circuit_open_count: inner.circuit_open_count,
            failure_rate: inner.outcomes.ratio_of(false).unwrap_or(0.0),
            slow_call_rate: inner
                .durations
                .ratio_above(self.config.slow_call_duration_threshold())
                .unwrap_or(0.0),
            average_response_time_ms: inner
                .durations
                .mean()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            last_failure_ago_ms: inner
                .last_failure_time
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Back to a fresh closed breaker; counters are cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let episode = inner.episode + 1;
        *inner = Inner::new(self.config.sliding_window_size);
        inner.episode = episode;
        metrics::record_circuit_state(&self.name, CircuitState::Closed);
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Open the circuit now. It still moves to half-open after the recovery timeout.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifiedError;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 200,
            recovery_timeout_ms: 50,
            half_open_max_calls: 2,
            sliding_window_size: 10,
            minimum_throughput: 100,
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> ReliabilityResult<()> {
        cb.call(|| async { Err::<(), _>(ClassifiedError::retryable("boom")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> ReliabilityResult<u32> {
        cb.call(|| async { Ok::<_, ReliabilityError>(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("test", config()).unwrap();

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(ReliabilityError::Operation(_))));
        }
        // A success resets the consecutive count.
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        for _ in 0..2 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, ReliabilityError::CircuitOpen { .. }));
        let m = cb.get_metrics();
        assert_eq!(m.rejected_calls, 1);
        assert_eq!(m.circuit_open_count, 1);
    }

    #[tokio::test]
    async fn test_opens_on_failure_rate() {
        let cb = CircuitBreaker::new(
            "rate",
            CircuitBreakerConfig {
                failure_threshold: 100,
                minimum_throughput: 4,
                failure_rate_threshold: 0.5,
                ..config()
            },
        )
        .unwrap();

        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let cb = CircuitBreaker::new("slow", CircuitBreakerConfig { timeout_ms: 20, ..config() }).unwrap();
        let err = cb
            .call(|| async {
                time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ReliabilityError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReliabilityError::Timeout { .. }));
        assert_eq!(cb.get_metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let cb = CircuitBreaker::new("recover", config()).unwrap();
        cb.force_open();
        time::sleep(Duration::from_millis(60)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("reopen", config()).unwrap();
        cb.force_open();
        time::sleep(Duration::from_millis(60)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.get_metrics().circuit_open_count, 2);
    }

    #[tokio::test]
    async fn test_fallback_on_rejection_and_failure() {
        let cb = CircuitBreaker::new("fb", config()).unwrap();

        let value = cb
            .call_with_fallback(
                || async { Err::<u32, _>(ClassifiedError::retryable("down")) },
                || async { Ok::<_, BoxError>(1) },
            )
            .await
            .unwrap();
        assert_eq!(value, 1);

        cb.force_open();
        let value = cb
            .call_with_fallback(|| async { Ok::<u32, ReliabilityError>(5) }, || async { Ok::<_, BoxError>(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);

        let err = cb
            .call_with_fallback(
                || async { Ok::<u32, ReliabilityError>(5) },
                || async { Err::<u32, BoxError>("cache empty".into()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReliabilityError::FallbackFailed(_)));
        assert_eq!(cb.get_metrics().fallback_calls, 3);
    }

    #[tokio::test]
    async fn test_cancelled_probe_returns_slot() {
        let cb = CircuitBreaker::new("cancel", config()).unwrap();
        cb.force_open();
        time::sleep(Duration::from_millis(60)).await;

        // Dropped before completion.
        let _ = time::timeout(
            Duration::from_millis(10),
            cb.call(|| async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ReliabilityError>(())
            }),
        )
        .await;
        assert_eq!(cb.get_metrics().half_open_calls, 0);

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = CircuitBreaker::new("reset", config()).unwrap();
        cb.force_open();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_metrics().circuit_open_count, 0);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }
}
