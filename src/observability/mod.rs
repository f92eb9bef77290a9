//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All components produce:
//!     → tracing events (structured key-value logs)
//!     → metrics.rs (counters, gauges, histograms via the `metrics` facade)
//!     → get_metrics() snapshots (serde::Serialize)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, pretty or JSON)
//!     → Prometheus exporter, when installed by the host process
//! ```
//!
//! Without an installed recorder the `metrics` macros are no-ops.

pub mod logging;
pub mod metrics;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for serialized timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
