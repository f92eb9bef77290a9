//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Request outcomes (pool.rs release path):
//!     → state.rs: consecutive failures >= max_failures → Unhealthy
//!
//! Active health checks (active.rs):
//!     Periodic timer
//!     → every registered callback against every instance
//!     → state.rs: failed check counts as a failure,
//!                 all passed + recovery_time since last failure → Healthy
//! ```
//!
//! Draining and Maintenance are operator states; health logic never moves
//! an instance into or out of them.

pub mod active;
pub mod state;

pub use active::HealthMonitor;
pub use state::{apply_check_result, apply_request_outcome, Transition};
