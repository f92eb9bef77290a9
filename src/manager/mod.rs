//! Protected-call orchestrator.
//!
//! # Pipeline
//! ```text
//! execute_with_protection(priority, op)
//!     → rate limiter      (denied → RateLimited)
//!     → load balancer     (none free → NoInstanceAvailable)
//!     → circuit breaker   (open → CircuitOpen or fallback)
//!         → retry handler (classify, back off, retry)
//!             → op(Some(instance))
//!     → release the instance with the last attempt's outcome
//!     → stats, health score, alerts
//! ```
//!
//! Every stage is optional and follows its section's `enabled` flag.
//! A call the breaker short-circuits never reaches the instance, so its
//! connection slot is freed without recording an outcome.

pub mod alerts;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::{Future, Ready};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, ReliabilityConfig};
use crate::error::{BoxError, ReliabilityError, ReliabilityResult};
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Instance, LoadBalancer, LoadBalancerMetrics};
use crate::observability::metrics;
use crate::rate_limit::{Priority, RateLimiter, RateLimiterMetrics};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitState, RetryHandler, RetryMetrics, RingBuffer,
};

pub use alerts::{Alert, AlertInputs, AlertKind, Severity};

/// Response times kept for the manager-level mean.
const RESPONSE_TIME_WINDOW: usize = 1_000;

type NoFallback<T> = fn() -> Ready<Result<T, BoxError>>;

#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub name: String,
    pub total_requests: u64,
    /// The operation itself succeeded.
    pub successful_requests: u64,
    /// Answered by the fallback after a rejection or failure.
    pub fallback_responses: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub no_instance_requests: u64,
    pub failure_rate: f64,
    pub average_response_time_ms: f64,
    pub health_score: f64,
    pub active_alerts: usize,
    pub circuit_breaker: Option<CircuitBreakerMetrics>,
    pub rate_limiter: Option<RateLimiterMetrics>,
    pub retry: Option<RetryMetrics>,
    pub load_balancer: Option<LoadBalancerMetrics>,
}

#[derive(Debug)]
struct Stats {
    total_requests: u64,
    successful_requests: u64,
    fallback_responses: u64,
    failed_requests: u64,
    rate_limited_requests: u64,
    no_instance_requests: u64,
    response_times: RingBuffer<Duration>,
}

impl Stats {
    fn new() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            fallback_responses: 0,
            failed_requests: 0,
            rate_limited_requests: 0,
            no_instance_requests: 0,
            response_times: RingBuffer::new(RESPONSE_TIME_WINDOW),
        }
    }

    /// Requests that reached execution and did not succeed on their own.
    fn failure_rate(&self) -> Option<f64> {
        let completed = self.successful_requests + self.fallback_responses + self.failed_requests;
        if completed == 0 {
            return None;
        }
        Some((self.fallback_responses + self.failed_requests) as f64 / completed as f64)
    }
}

/// Outcome of the most recent invocation of the unit of work.
#[derive(Debug, Default)]
struct OutcomeTracker(AtomicU8);

impl OutcomeTracker {
    const NOT_INVOKED: u8 = 0;
    const SUCCEEDED: u8 = 1;
    const FAILED: u8 = 2;

    /// Pessimistic until the attempt completes, so a timed-out attempt counts as failed.
    fn started(&self) {
        self.0.store(Self::FAILED, Ordering::Release);
    }

    fn finished(&self, ok: bool) {
        self.0
            .store(if ok { Self::SUCCEEDED } else { Self::FAILED }, Ordering::Release);
    }

    /// `None` if the work never ran.
    fn last(&self) -> Option<bool> {
        match self.0.load(Ordering::Acquire) {
            Self::NOT_INVOKED => None,
            state => Some(state == Self::SUCCEEDED),
        }
    }
}

/// Owns the reliability components for one dependency and runs calls through them.
#[derive(Debug)]
pub struct ReliabilityManager {
    name: String,
    config: ReliabilityConfig,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    retry_handler: Option<RetryHandler>,
    load_balancer: Option<Arc<LoadBalancer>>,
    stats: Mutex<Stats>,
    alerts: ArcSwap<Vec<Alert>>,
    alert_history: Mutex<RingBuffer<Alert>>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliabilityManager {
    /// Validate `config` and build every enabled component.
    pub fn new(config: ReliabilityConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let name = config.manager.name.clone();

        let circuit_breaker = config
            .circuit_breaker
            .enabled
            .then(|| CircuitBreaker::new(name.clone(), config.circuit_breaker.clone()))
            .transpose()?;
        let rate_limiter = config
            .rate_limiter
            .enabled
            .then(|| RateLimiter::new(name.clone(), config.rate_limiter.clone()))
            .transpose()?;
        let retry_handler = config
            .retry
            .enabled
            .then(|| RetryHandler::new(name.clone(), config.retry.clone()))
            .transpose()?;
        let load_balancer = config
            .load_balancer
            .enabled
            .then(|| LoadBalancer::new(name.clone(), config.load_balancer.clone()).map(Arc::new))
            .transpose()?;

        tracing::info!(
            manager = %name,
            circuit_breaker = circuit_breaker.is_some(),
            rate_limiter = rate_limiter.is_some(),
            retry = retry_handler.is_some(),
            load_balancer = load_balancer.is_some(),
            "Reliability manager created"
        );

        Ok(Self {
            alert_history: Mutex::new(RingBuffer::new(config.manager.alert_history_size)),
            name,
            circuit_breaker,
            rate_limiter,
            retry_handler,
            load_balancer,
            stats: Mutex::new(Stats::new()),
            alerts: ArcSwap::from_pointee(Vec::new()),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn retry_handler(&self) -> Option<&RetryHandler> {
        self.retry_handler.as_ref()
    }

    /// Mutable access before the manager is shared, e.g. to register classifier rules.
    pub fn retry_handler_mut(&mut self) -> Option<&mut RetryHandler> {
        self.retry_handler.as_mut()
    }

    pub fn load_balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.load_balancer.as_ref()
    }

    /// Spawn the health-check and alert loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.shutdown.is_triggered() {
            return;
        }

        if let Some(lb) = &self.load_balancer {
            let monitor = HealthMonitor::new(Arc::clone(lb), self.config.load_balancer.health_check.clone());
            tasks.push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
        }

        let weak = Arc::downgrade(self);
        let mut signal = self.shutdown.subscribe();
        let period = self.config.manager.alert_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.evaluate_alerts();
                    }
                    _ = signal.recv() => break,
                }
            }
        }));

        tracing::info!(manager = %self.name, tasks = tasks.len(), "Background loops started");
    }

    /// Stop every loop, wait for them, and deny queued rate-limit waiters.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(manager = %self.name, error = %e, "Background task failed");
            }
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.shutdown();
        }
        tracing::info!(manager = %self.name, "Reliability manager shut down");
    }

    /// Run `op` through every enabled component.
    ///
    /// `op` receives the selected instance (`None` without a load balancer)
    /// and may be invoked several times when retries are enabled.
    pub async fn execute_with_protection<T, F, Fut, E>(&self, priority: Priority, op: F) -> ReliabilityResult<T>
    where
        F: FnMut(Option<Instance>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
    {
        self.execute(priority, op, None::<NoFallback<T>>).await
    }

    /// Like [`execute_with_protection`](Self::execute_with_protection), answering
    /// breaker rejections and execution failures with `fallback`.
    ///
    /// Admission denials are still returned as errors.
    pub async fn execute_with_fallback<T, F, Fut, E, FB, FFut, GE>(
        &self,
        priority: Priority,
        op: F,
        fallback: FB,
    ) -> ReliabilityResult<T>
    where
        F: FnMut(Option<Instance>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        self.execute(priority, op, Some(fallback)).await
    }

    async fn execute<T, F, Fut, E, FB, FFut, GE>(
        &self,
        priority: Priority,
        mut op: F,
        fallback: Option<FB>,
    ) -> ReliabilityResult<T>
    where
        F: FnMut(Option<Instance>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ReliabilityError>,
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        let started = Instant::now();
        self.stats.lock().total_requests += 1;

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.acquire(priority, None).await {
                self.stats.lock().rate_limited_requests += 1;
                metrics::record_request(&self.name, "rate_limited", started.elapsed());
                return Err(ReliabilityError::RateLimited {
                    resource: self.name.clone(),
                });
            }
        }

        let lease = match &self.load_balancer {
            Some(lb) => match lb.acquire(None) {
                Some(lease) => Some(lease),
                None => {
                    self.stats.lock().no_instance_requests += 1;
                    metrics::record_request(&self.name, "no_instance", started.elapsed());
                    return Err(ReliabilityError::NoInstanceAvailable {
                        resource: self.name.clone(),
                    });
                }
            },
            None => None,
        };

        let target = lease.as_ref().map(|l| l.instance().clone());
        let tracker = OutcomeTracker::default();
        let tracker_ref = &tracker;
        let mut attempt = move || {
            tracker_ref.started();
            let fut = op(target.clone());
            async move {
                let result = fut.await;
                tracker_ref.finished(result.is_ok());
                result
            }
        };

        let called_at = Instant::now();
        // The breaker answers with the fallback itself; without one it is applied here.
        let result = match (&self.circuit_breaker, &self.retry_handler) {
            (Some(cb), Some(retry)) => {
                let attempt = &mut attempt;
                match fallback {
                    Some(fb) => cb.call_with_fallback(move || retry.execute_with_retry(attempt), fb).await,
                    None => cb.call(move || retry.execute_with_retry(attempt)).await,
                }
            }
            (Some(cb), None) => match fallback {
                Some(fb) => cb.call_with_fallback(attempt, fb).await,
                None => cb.call(attempt).await,
            },
            (None, Some(retry)) => {
                let result = retry.execute_with_retry(&mut attempt).await;
                self.apply_fallback(result, fallback).await
            }
            (None, None) => {
                let result = attempt().await.map_err(Into::into);
                self.apply_fallback(result, fallback).await
            }
        };
        let elapsed = called_at.elapsed();

        let op_outcome = tracker.last();
        match (lease, op_outcome) {
            (Some(lease), Some(success)) => lease.release(elapsed, success),
            // Short-circuited: dropping the lease frees the slot without an outcome.
            (Some(lease), None) => drop(lease),
            (None, _) => {}
        }

        let outcome = match (&result, op_outcome) {
            (Ok(_), Some(true)) => "success",
            (Ok(_), _) => "fallback",
            (Err(_), _) => "failure",
        };
        {
            let mut stats = self.stats.lock();
            match outcome {
                "success" => stats.successful_requests += 1,
                "fallback" => stats.fallback_responses += 1,
                _ => stats.failed_requests += 1,
            }
            stats.response_times.push(elapsed);
        }
        metrics::record_request(&self.name, outcome, started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(manager = %self.name, category = ?e.category(), error = %e, "Protected call failed");
        }
        result
    }

    async fn apply_fallback<T, FB, FFut, GE>(
        &self,
        result: ReliabilityResult<T>,
        fallback: Option<FB>,
    ) -> ReliabilityResult<T>
    where
        FB: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, GE>>,
        GE: Into<BoxError>,
    {
        match (result, fallback) {
            (Err(e), Some(fb)) => {
                tracing::debug!(manager = %self.name, error = %e, "Using fallback");
                fb().await.map_err(|e| ReliabilityError::FallbackFailed(e.into()))
            }
            (result, _) => result,
        }
    }

    /// Current health score in `0.0..=1.0`.
    pub fn system_health_score(&self) -> f64 {
        let (failure_rate, mean) = {
            let stats = self.stats.lock();
            (stats.failure_rate().unwrap_or(0.0), stats.response_times.mean())
        };
        let breaker_open = self
            .circuit_breaker
            .as_ref()
            .is_some_and(|cb| cb.state() == CircuitState::Open);
        alerts::health_score(failure_rate, mean, breaker_open)
    }

    /// Evaluate thresholds now, replace the current alert set and append to history.
    pub fn evaluate_alerts(&self) -> Arc<Vec<Alert>> {
        let (failure_rate, mean_response_time) = {
            let stats = self.stats.lock();
            (stats.failure_rate(), stats.response_times.mean())
        };
        let breaker = self.circuit_breaker.as_ref().map(|cb| cb.get_metrics());
        let inputs = AlertInputs {
            failure_rate,
            mean_response_time,
            circuit_open_count: breaker.as_ref().map_or(0, |m| m.circuit_open_count),
            circuit_state: breaker.as_ref().map(|m| m.state),
        };

        let current = Arc::new(alerts::evaluate(&inputs, &self.config.manager));
        {
            let mut history = self.alert_history.lock();
            for alert in current.iter() {
                tracing::warn!(
                    manager = %self.name,
                    kind = alert.kind.as_str(),
                    severity = alert.severity.as_str(),
                    message = %alert.message,
                    "Reliability alert"
                );
                metrics::record_alert(&self.name, alert.kind.as_str(), alert.severity.as_str());
                history.push(alert.clone());
            }
        }
        self.alerts.store(Arc::clone(&current));
        metrics::record_health_score(&self.name, self.system_health_score());
        current
    }

    /// Alerts from the most recent evaluation.
    pub fn alerts(&self) -> Arc<Vec<Alert>> {
        self.alerts.load_full()
    }

    /// Up to `n` most recent alerts, newest first.
    pub fn alert_history(&self, n: usize) -> Vec<Alert> {
        self.alert_history.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn get_metrics(&self) -> ManagerMetrics {
        let (snapshot, failure_rate, mean) = {
            let stats = self.stats.lock();
            (
                (
                    stats.total_requests,
                    stats.successful_requests,
                    stats.fallback_responses,
                    stats.failed_requests,
                    stats.rate_limited_requests,
                    stats.no_instance_requests,
                ),
                stats.failure_rate().unwrap_or(0.0),
                stats.response_times.mean(),
            )
        };
        let (total, successful, fallback, failed, rate_limited, no_instance) = snapshot;

        ManagerMetrics {
            name: self.name.clone(),
            total_requests: total,
            successful_requests: successful,
            fallback_responses: fallback,
            failed_requests: failed,
            rate_limited_requests: rate_limited,
            no_instance_requests: no_instance,
            failure_rate,
            average_response_time_ms: mean.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0),
            health_score: self.system_health_score(),
            active_alerts: self.alerts.load().len(),
            circuit_breaker: self.circuit_breaker.as_ref().map(CircuitBreaker::get_metrics),
            rate_limiter: self.rate_limiter.as_ref().map(RateLimiter::get_metrics),
            retry: self.retry_handler.as_ref().map(RetryHandler::get_metrics),
            load_balancer: self.load_balancer.as_ref().map(|lb| lb.get_metrics()),
        }
    }

    /// Reset statistics, alerts and every component.
    pub fn reset(&self) {
        *self.stats.lock() = Stats::new();
        self.alerts.store(Arc::new(Vec::new()));
        self.alert_history.lock().clear();
        if let Some(cb) = &self.circuit_breaker {
            cb.reset();
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.reset();
        }
        if let Some(retry) = &self.retry_handler {
            retry.reset();
        }
        if let Some(lb) = &self.load_balancer {
            lb.reset();
        }
        tracing::info!(manager = %self.name, "Reliability manager reset");
    }
}

impl Drop for ReliabilityManager {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::error::ClassifiedError;
    use crate::load_balancer::InstanceStatus;
    use std::sync::atomic::AtomicU32;

    fn config() -> ReliabilityConfig {
        let mut config = ReliabilityConfig::default();
        config.manager.name = "orders".into();
        config.rate_limiter.enabled = false;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.load_balancer.health_check.enabled = false;
        config.load_balancer.instances = vec![InstanceConfig {
            id: "a".into(),
            host: "10.0.0.1".into(),
            port: 80,
            weight: 1.0,
            max_connections: 10,
        }];
        config
    }

    #[tokio::test]
    async fn test_op_receives_instance_and_retries() {
        let manager = ReliabilityManager::new(config()).unwrap();
        let calls = AtomicU32::new(0);

        let value = manager
            .execute_with_protection(Priority::Normal, |instance| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match instance {
                        Some(_) if n == 0 => Err(ClassifiedError::retryable("blip")),
                        Some(instance) => Ok(instance.address()),
                        None => Err(ClassifiedError::non_retryable("no target")),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "10.0.0.1:80");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let m = manager.get_metrics();
        assert_eq!(m.successful_requests, 1);
        let lb = m.load_balancer.unwrap();
        assert_eq!(lb.instances[0].successful_requests, 1);
        assert_eq!(lb.instances[0].current_connections, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_is_admission_denial() {
        let mut config = config();
        config.rate_limiter.enabled = true;
        config.rate_limiter.strategy = crate::rate_limit::RateLimitStrategy::SlidingWindow;
        config.rate_limiter.max_requests = 1;
        config.rate_limiter.enable_queue = false;
        let manager = ReliabilityManager::new(config).unwrap();

        let ok = manager
            .execute_with_protection(Priority::Normal, |_| async { Ok::<_, ReliabilityError>(1) })
            .await;
        assert!(ok.is_ok());

        let err = manager
            .execute_with_protection(Priority::Normal, |_| async { Ok::<_, ReliabilityError>(1) })
            .await
            .unwrap_err();
        assert!(err.is_admission_denial());
        assert_eq!(manager.get_metrics().rate_limited_requests, 1);
    }

    #[tokio::test]
    async fn test_fallback_without_breaker() {
        let mut config = config();
        config.circuit_breaker.enabled = false;
        config.retry.enabled = false;
        config.load_balancer.enabled = false;
        let manager = ReliabilityManager::new(config).unwrap();

        let value = manager
            .execute_with_fallback(
                Priority::Low,
                |instance| async move {
                    assert!(instance.is_none());
                    Err::<&str, _>(ClassifiedError::retryable("down"))
                },
                || async { Ok::<_, BoxError>("cached") },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(manager.get_metrics().fallback_responses, 1);
    }

    #[tokio::test]
    async fn test_alerts_and_health_score() {
        let mut config = config();
        config.retry.enabled = false;
        config.circuit_breaker.failure_threshold = 1;
        let manager = ReliabilityManager::new(config).unwrap();
        assert_eq!(manager.system_health_score(), 1.0);

        let _ = manager
            .execute_with_protection(Priority::Normal, |_| async {
                Err::<(), _>(ClassifiedError::retryable("boom"))
            })
            .await;

        let alerts = manager.evaluate_alerts();
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::HighFailureRate, AlertKind::CircuitOpen]);
        assert_eq!(manager.alerts().len(), 2);
        assert_eq!(manager.alert_history(10).len(), 2);
        // failure 1.0 → 0, response 1.0, breaker open 0.5
        assert!((manager.system_health_score() - 0.5).abs() < 1e-9);

        manager.reset();
        assert!(manager.alerts().is_empty());
        assert_eq!(manager.system_health_score(), 1.0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = config();
        config.rate_limiter.enabled = true;
        config.load_balancer.health_check.enabled = true;
        config.load_balancer.health_check.interval_ms = 10;
        config.manager.alert_interval_ms = 10;
        let manager = Arc::new(ReliabilityManager::new(config).unwrap());

        manager.start();
        manager.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .unwrap();

        let rejected = manager
            .execute_with_protection(Priority::Critical, |_| async { Ok::<_, ReliabilityError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(rejected, ReliabilityError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_health_loop_recovers_instance() {
        let mut config = config();
        config.retry.enabled = false;
        config.load_balancer.max_failures = 1;
        config.load_balancer.recovery_time_ms = 20;
        config.load_balancer.health_check.enabled = true;
        config.load_balancer.health_check.interval_ms = 10;
        let manager = Arc::new(ReliabilityManager::new(config).unwrap());

        let _ = manager
            .execute_with_protection(Priority::Normal, |_| async {
                Err::<(), _>(ClassifiedError::non_retryable("refused"))
            })
            .await;
        let lb = manager.load_balancer().unwrap();
        assert_eq!(lb.instance("a").unwrap().status, InstanceStatus::Unhealthy);

        lb.register_health_check("ok", |_| async { Ok(true) });
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lb.instance("a").unwrap().status, InstanceStatus::Healthy);

        manager.shutdown().await;
    }
}
