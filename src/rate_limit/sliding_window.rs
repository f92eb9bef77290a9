//! Exact sliding-window counter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admits at most `max_requests` within any `window`-long interval.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: Duration,
    max_requests: usize,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            timestamps: VecDeque::with_capacity(max_requests),
        }
    }

    /// Drop admissions that have left the window.
    fn trim(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.has_capacity(now) {
            self.record(now);
            true
        } else {
            false
        }
    }

    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.trim(now);
        self.timestamps.len() < self.max_requests
    }

    pub fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    /// Undo the most recent admission.
    pub fn refund(&mut self) {
        self.timestamps.pop_back();
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.trim(now);
        self.timestamps.len()
    }

    pub fn fill_ratio(&mut self, now: Instant) -> f64 {
        self.count(now) as f64 / self.max_requests as f64
    }

    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.trim(now);
        if self.timestamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        self.timestamps
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}
