//! Instance health state machine.
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= max_failures
//!                      (failed requests and failed checks both count)
//! Unhealthy → Healthy: every check passed and recovery_time has elapsed
//!                      since the last failure
//! ```
//!
//! Counters reset on recovery.

use std::time::{Duration, Instant};

use crate::load_balancer::{Instance, InstanceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameUnhealthy,
    Recovered,
}

/// Apply a completed request to the instance's health.
/// The counters themselves are updated by [`Instance::record_response`].
pub fn apply_request_outcome(instance: &mut Instance, max_failures: u32) -> Transition {
    if instance.status == InstanceStatus::Healthy && instance.consecutive_failures >= max_failures {
        instance.status = InstanceStatus::Unhealthy;
        return Transition::BecameUnhealthy;
    }
    Transition::Unchanged
}

/// Apply the combined result of one health-check pass.
pub fn apply_check_result(
    instance: &mut Instance,
    passed: bool,
    max_failures: u32,
    recovery_time: Duration,
    now: Instant,
) -> Transition {
    instance.last_health_check = Some(now);

    if !passed {
        instance.consecutive_failures += 1;
        instance.last_failure = Some(now);
        return apply_request_outcome(instance, max_failures);
    }

    if instance.status != InstanceStatus::Unhealthy {
        return Transition::Unchanged;
    }

    let since_failure = instance
        .last_failure
        .map(|t| now.saturating_duration_since(t))
        .unwrap_or(Duration::MAX);
    if since_failure >= recovery_time {
        instance.status = InstanceStatus::Healthy;
        instance.consecutive_failures = 0;
        Transition::Recovered
    } else {
        Transition::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_mark_unhealthy() {
        let now = Instant::now();
        let mut inst = Instance::new("a", "h", 1);
        inst.record_response(Duration::from_millis(1), false, now);
        assert_eq!(apply_request_outcome(&mut inst, 2), Transition::Unchanged);
        inst.record_response(Duration::from_millis(1), false, now);
        assert_eq!(apply_request_outcome(&mut inst, 2), Transition::BecameUnhealthy);
        assert_eq!(inst.status, InstanceStatus::Unhealthy);
    }

    #[test]
    fn test_recovery_waits_for_recovery_time() {
        let t0 = Instant::now();
        let mut inst = Instance::new("a", "h", 1);
        inst.status = InstanceStatus::Unhealthy;
        inst.last_failure = Some(t0);

        let recovery = Duration::from_secs(30);
        assert_eq!(
            apply_check_result(&mut inst, true, 3, recovery, t0 + Duration::from_secs(10)),
            Transition::Unchanged
        );
        // A failed check restarts the clock.
        apply_check_result(&mut inst, false, 3, recovery, t0 + Duration::from_secs(20));
        assert_eq!(
            apply_check_result(&mut inst, true, 3, recovery, t0 + Duration::from_secs(40)),
            Transition::Unchanged
        );
        assert_eq!(
            apply_check_result(&mut inst, true, 3, recovery, t0 + Duration::from_secs(50)),
            Transition::Recovered
        );
        assert_eq!(inst.consecutive_failures, 0);
    }

    #[test]
    fn test_operator_states_untouched() {
        let now = Instant::now();
        let mut inst = Instance::new("a", "h", 1);
        inst.status = InstanceStatus::Maintenance;
        for _ in 0..5 {
            apply_check_result(&mut inst, false, 1, Duration::ZERO, now);
        }
        assert_eq!(inst.status, InstanceStatus::Maintenance);
        apply_check_result(&mut inst, true, 1, Duration::ZERO, now);
        assert_eq!(inst.status, InstanceStatus::Maintenance);
    }
}
