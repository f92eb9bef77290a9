//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every ShutdownSignal resolves → loops exit → owner awaits their handles
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_termination() resolves → binary stops its workload
//! ```
//!
//! The signal is sticky: a loop that subscribes after the trigger still exits.

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
