//! Rate limiter with priority-queued backpressure.
//!
//! # Admission
//! ```text
//! acquire(priority, timeout)
//!     → queue empty and strategy admits → granted
//!     → queue disabled                  → rejected
//!     → queue full                      → rejected
//!     → otherwise enqueue and wait for the dispatcher (or the deadline)
//! ```
//!
//! The dispatcher task is spawned on the first enqueue and exits once the
//! queue is empty. It grants one waiter per admission, highest priority
//! first, and discards expired waiters when they reach the head.
//!
//! Every queued waiter leaves the queue exactly once: granted, denied by
//! shutdown, or abandoned. Whoever takes the entry out does the accounting.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{ConfigError, RateLimiterConfig};
use crate::observability::metrics;

use super::priority_queue::PriorityQueue;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use super::{Priority, RateLimitStrategy};

/// Bounds on the dispatcher's sleep between admission checks.
const DISPATCH_MIN_WAIT: Duration = Duration::from_millis(1);
const DISPATCH_MAX_WAIT: Duration = Duration::from_millis(100);

const HIGH_LOAD: f64 = 0.8;
const LOW_LOAD: f64 = 0.5;
const DECREASE_FACTOR: f64 = 0.9;
const INCREASE_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    pub name: String,
    pub strategy: RateLimitStrategy,
    pub total_requests: u64,
    pub allowed_requests: u64,
    /// Denied immediately: queue disabled, full, or shut down.
    pub rejected_requests: u64,
    pub queued_requests: u64,
    /// Waiters that left the queue without a grant: deadline passed or caller gone.
    pub queue_timeouts: u64,
    pub queue_size: usize,
    pub rate_factor: f64,
    pub effective_rate: f64,
    pub available_tokens: f64,
    pub window_count: usize,
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    window: SlidingWindow,
    queue: PriorityQueue<oneshot::Sender<bool>>,
    rate_factor: f64,
    last_adjustment: Instant,
    dispatcher_running: bool,
    shut_down: bool,

    total_requests: u64,
    allowed_requests: u64,
    rejected_requests: u64,
    queued_requests: u64,
    queue_timeouts: u64,
}

impl LimiterState {
    fn new(config: &RateLimiterConfig) -> Self {
        let now = Instant::now();
        Self {
            bucket: TokenBucket::new(config.requests_per_second, f64::from(config.burst_size), now),
            window: SlidingWindow::new(config.window(), config.max_requests),
            queue: PriorityQueue::new(config.max_queue_size),
            rate_factor: 1.0,
            last_adjustment: now,
            dispatcher_running: false,
            shut_down: false,
            total_requests: 0,
            allowed_requests: 0,
            rejected_requests: 0,
            queued_requests: 0,
            queue_timeouts: 0,
        }
    }

    /// Deny every queued waiter. Returns how many were denied.
    fn deny_all(&mut self) -> usize {
        let drained = self.queue.drain();
        let n = drained.len();
        for entry in drained {
            let _ = entry.value.send(false);
        }
        n
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

enum Step {
    Exit,
    Granted,
    Wait(Duration),
}

impl Shared {
    fn admit(&self, st: &mut LimiterState, now: Instant) -> bool {
        match self.config.strategy {
            RateLimitStrategy::TokenBucket => st.bucket.try_acquire(now),
            RateLimitStrategy::SlidingWindow => st.window.try_acquire(now),
            RateLimitStrategy::Adaptive => {
                if st.bucket.has_token(now) && st.window.has_capacity(now) {
                    st.bucket.consume();
                    st.window.record(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn refund(&self, st: &mut LimiterState) {
        match self.config.strategy {
            RateLimitStrategy::TokenBucket => st.bucket.refund(),
            RateLimitStrategy::SlidingWindow => st.window.refund(),
            RateLimitStrategy::Adaptive => {
                st.bucket.refund();
                st.window.refund();
            }
        }
    }

    fn time_until_available(&self, st: &mut LimiterState, now: Instant) -> Duration {
        match self.config.strategy {
            RateLimitStrategy::TokenBucket => st.bucket.time_until_available(now),
            RateLimitStrategy::SlidingWindow => st.window.time_until_available(now),
            RateLimitStrategy::Adaptive => st
                .bucket
                .time_until_available(now)
                .max(st.window.time_until_available(now)),
        }
    }

    fn maybe_adjust(&self, st: &mut LimiterState, now: Instant) {
        if self.config.strategy == RateLimitStrategy::Adaptive
            && now.saturating_duration_since(st.last_adjustment) >= self.config.adjustment_interval()
        {
            self.adjust(st, now);
        }
    }

    fn adjust(&self, st: &mut LimiterState, now: Instant) -> f64 {
        let load = st.window.fill_ratio(now).max(st.bucket.depletion(now));
        let previous = st.rate_factor;

        let factor = if load > HIGH_LOAD {
            previous * DECREASE_FACTOR
        } else if load < LOW_LOAD {
            previous * INCREASE_FACTOR
        } else {
            previous
        };
        st.rate_factor = factor.clamp(self.config.min_rate_factor, self.config.max_rate_factor);
        st.bucket
            .set_rate(self.config.requests_per_second * st.rate_factor, now);
        st.last_adjustment = now;

        if st.rate_factor != previous {
            tracing::debug!(
                limiter = %self.name,
                load,
                rate_factor = st.rate_factor,
                "Rate factor adjusted"
            );
            metrics::record_rate_factor(&self.name, st.rate_factor);
        }
        st.rate_factor
    }

    fn record_abandoned(&self, st: &mut LimiterState, outcome: &'static str) {
        st.queue_timeouts += 1;
        metrics::record_rate_limit(&self.name, outcome);
        metrics::record_queue_depth(&self.name, st.queue.len());
    }

    /// One dispatcher iteration, under the lock.
    fn dispatch_step(&self) -> Step {
        let mut st = self.state.lock();
        let now = Instant::now();

        // Dropping a discarded sender wakes its waiter with a denial.
        let stale = st.queue.discard_stale(now, |tx| tx.is_closed());
        for _ in stale {
            self.record_abandoned(&mut st, "queue_timeout");
        }
        if st.shut_down || st.queue.is_empty() {
            st.dispatcher_running = false;
            metrics::record_queue_depth(&self.name, st.queue.len());
            return Step::Exit;
        }

        self.maybe_adjust(&mut st, now);
        if !self.admit(&mut st, now) {
            let wait = self.time_until_available(&mut st, now);
            return Step::Wait(wait.clamp(DISPATCH_MIN_WAIT, DISPATCH_MAX_WAIT));
        }

        match st.queue.pop() {
            Some(entry) => {
                if entry.value.send(true).is_ok() {
                    st.allowed_requests += 1;
                    metrics::record_rate_limit(&self.name, "granted_from_queue");
                } else {
                    // The waiter gave up between the staleness check and the grant.
                    self.refund(&mut st);
                    self.record_abandoned(&mut st, "queue_cancelled");
                }
            }
            None => self.refund(&mut st),
        }
        metrics::record_queue_depth(&self.name, st.queue.len());
        Step::Granted
    }
}

/// A queued `acquire`. Dropped while armed, it takes its entry out of the queue.
struct QueuedWaiter<'a> {
    shared: &'a Shared,
    request_id: Uuid,
    armed: bool,
}

impl QueuedWaiter<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Settle a waiter whose deadline passed. A grant sent just before the
    /// deadline still counts.
    fn expire(mut self, rx: &mut oneshot::Receiver<bool>) -> bool {
        self.armed = false;
        let mut st = self.shared.state.lock();
        if st.queue.remove(&self.request_id).is_some() {
            self.shared.record_abandoned(&mut st, "queue_timeout");
            return false;
        }
        // Already popped; the dispatcher sends under this lock, so any grant is visible.
        rx.try_recv().unwrap_or(false)
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.shared.state.lock();
        if st.queue.remove(&self.request_id).is_some() {
            tracing::debug!(limiter = %self.shared.name, request_id = %self.request_id, "Queued request cancelled");
            self.shared.record_abandoned(&mut st, "queue_cancelled");
        }
    }
}

async fn run_dispatcher(shared: Arc<Shared>) {
    tracing::debug!(limiter = %shared.name, "Queue dispatcher started");
    loop {
        match shared.dispatch_step() {
            Step::Exit => break,
            Step::Granted => tokio::task::yield_now().await,
            Step::Wait(wait) => tokio::time::sleep(wait).await,
        }
    }
    tracing::debug!(limiter = %shared.name, "Queue dispatcher idle, exiting");
}

/// Token-bucket / sliding-window admission control with a priority wait queue.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        ConfigError::check(config.violations())?;
        let name = name.into();
        tracing::info!(
            limiter = %name,
            strategy = ?config.strategy,
            requests_per_second = config.requests_per_second,
            burst_size = config.burst_size,
            queue = config.enable_queue,
            "Rate limiter created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LimiterState::new(&config)),
                name,
                config,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.shared.config
    }

    /// Wait for admission.
    ///
    /// Returns `false` when the caller is rejected outright or its deadline
    /// passes while queued. `timeout` defaults to the configured queue timeout.
    pub async fn acquire(&self, priority: Priority, timeout: Option<Duration>) -> bool {
        let shared = &self.shared;
        let deadline = timeout.unwrap_or_else(|| shared.config.queue_timeout());

        let (request_id, mut rx) = {
            let mut st = shared.state.lock();
            let now = Instant::now();
            st.total_requests += 1;

            if st.shut_down {
                st.rejected_requests += 1;
                metrics::record_rate_limit(&shared.name, "rejected");
                return false;
            }

            shared.maybe_adjust(&mut st, now);
            // Newcomers may not overtake waiters.
            if st.queue.is_empty() && shared.admit(&mut st, now) {
                st.allowed_requests += 1;
                metrics::record_rate_limit(&shared.name, "allowed");
                return true;
            }

            if !shared.config.enable_queue {
                st.rejected_requests += 1;
                metrics::record_rate_limit(&shared.name, "rejected");
                return false;
            }

            let (tx, rx) = oneshot::channel();
            // Too large to represent means no expiry.
            let expires_at = now.checked_add(deadline);
            let request_id = match st.queue.push(priority, expires_at, tx) {
                Ok(id) => id,
                Err(_) => {
                    st.rejected_requests += 1;
                    metrics::record_rate_limit(&shared.name, "rejected");
                    tracing::debug!(limiter = %shared.name, ?priority, "Queue full, rejecting");
                    return false;
                }
            };
            st.queued_requests += 1;
            metrics::record_rate_limit(&shared.name, "queued");
            metrics::record_queue_depth(&shared.name, st.queue.len());
            tracing::debug!(limiter = %shared.name, %request_id, ?priority, "Request queued");

            if !st.dispatcher_running {
                st.dispatcher_running = true;
                tokio::spawn(run_dispatcher(Arc::clone(shared)));
            }
            (request_id, rx)
        };

        let waiter = QueuedWaiter {
            shared,
            request_id,
            armed: true,
        };
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(granted)) => {
                waiter.disarm();
                granted
            }
            // Discarded at the head by the dispatcher, which counted it.
            Ok(Err(_)) => {
                waiter.disarm();
                false
            }
            Err(_) => waiter.expire(&mut rx),
        }
    }

    /// Admit without queuing.
    ///
    /// While callers are queued, only a priority above the head's may pass.
    pub fn try_acquire(&self, priority: Priority) -> bool {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let now = Instant::now();
        st.total_requests += 1;

        let may_overtake = st.queue.peek().map_or(true, |head| priority > head.priority);
        if !st.shut_down && may_overtake {
            shared.maybe_adjust(&mut st, now);
            if shared.admit(&mut st, now) {
                st.allowed_requests += 1;
                metrics::record_rate_limit(&shared.name, "allowed");
                return true;
            }
        }
        st.rejected_requests += 1;
        metrics::record_rate_limit(&shared.name, "rejected");
        false
    }

    /// Run one adaptive adjustment pass now. Returns the new rate factor.
    pub fn adjust_rate(&self) -> f64 {
        let mut st = self.shared.state.lock();
        self.shared.adjust(&mut st, Instant::now())
    }

    pub fn get_metrics(&self) -> RateLimiterMetrics {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let now = Instant::now();
        RateLimiterMetrics {
            name: shared.name.clone(),
            strategy: shared.config.strategy,
            total_requests: st.total_requests,
            allowed_requests: st.allowed_requests,
            rejected_requests: st.rejected_requests,
            queued_requests: st.queued_requests,
            queue_timeouts: st.queue_timeouts,
            queue_size: st.queue.len(),
            rate_factor: st.rate_factor,
            effective_rate: st.bucket.rate(),
            available_tokens: st.bucket.tokens(now),
            window_count: st.window.count(now),
        }
    }

    /// Restore a full bucket, an empty window and a neutral rate factor.
    /// Queued waiters are denied.
    pub fn reset(&self) {
        let mut st = self.shared.state.lock();
        let denied = st.deny_all();
        let running = st.dispatcher_running;
        let shut_down = st.shut_down;
        *st = LimiterState::new(&self.shared.config);
        st.dispatcher_running = running;
        st.shut_down = shut_down;
        tracing::info!(limiter = %self.shared.name, denied, "Rate limiter reset");
    }

    /// Deny all waiters and every later request.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock();
        st.shut_down = true;
        let denied = st.deny_all();
        st.rejected_requests += denied as u64;
        metrics::record_queue_depth(&self.shared.name, 0);
        tracing::info!(limiter = %self.shared.name, denied, "Rate limiter shut down");
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}
