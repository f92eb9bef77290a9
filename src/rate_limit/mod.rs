//! Admission control.
//!
//! # Data Flow
//! ```text
//! acquire(priority, timeout)
//!     → limiter.rs (strategy check, adaptive rate factor)
//!         → token_bucket.rs / sliding_window.rs
//!     → denied: priority_queue.rs (wait for the dispatcher, or give up at the deadline)
//! ```

pub mod limiter;
pub mod priority_queue;
pub mod sliding_window;
pub mod token_bucket;

use serde::{Deserialize, Serialize};

pub use limiter::{RateLimiter, RateLimiterMetrics};
pub use priority_queue::PriorityQueue;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Which admission check a limiter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
    /// Bucket and window must both admit; the bucket rate follows load.
    #[default]
    Adaptive,
}

/// Queue priority. Higher priorities are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}
