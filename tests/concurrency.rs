//! Concurrent behaviour of the individual components.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reliability_core::config::{CircuitBreakerConfig, LoadBalancerConfig, RateLimiterConfig};
use reliability_core::load_balancer::{InstanceStatus, LoadBalancer, LoadBalancingAlgorithm, SelectionContext};
use reliability_core::rate_limit::{RateLimitStrategy, RateLimiter};
use reliability_core::resilience::{CircuitBreaker, CircuitState};
use reliability_core::{ClassifiedError, Priority, ReliabilityError, ReliabilityManager};

mod common;

#[tokio::test]
async fn test_half_open_admits_bounded_probes() {
    let breaker = CircuitBreaker::new(
        "probe",
        CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            half_open_max_calls: 2,
            recovery_timeout_ms: 50,
            ..Default::default()
        },
    )
    .unwrap();

    let _ = breaker
        .call(|| async { Err::<(), _>(ClassifiedError::retryable("down")) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let invoked = AtomicU32::new(0);
    let probe = || {
        invoked.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, ReliabilityError>(())
        }
    };
    let (a, b, c, d) = tokio::join!(
        breaker.call(probe),
        breaker.call(probe),
        breaker.call(probe),
        breaker.call(probe),
    );

    let results = [a, b, c, d];
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(ReliabilityError::CircuitOpen { .. })))
        .count();
    assert_eq!(invoked.load(Ordering::SeqCst), 2);
    assert_eq!((admitted, rejected), (2, 2));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_queued_waiters_are_served_by_priority() {
    let limiter = RateLimiter::new(
        "queue",
        RateLimiterConfig {
            strategy: RateLimitStrategy::TokenBucket,
            requests_per_second: 10.0,
            burst_size: 1,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(limiter.try_acquire(Priority::Normal));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for priority in [Priority::Low, Priority::High, Priority::Normal] {
        let limiter = limiter.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let granted = limiter.acquire(priority, Some(Duration::from_secs(2))).await;
            order.lock().push((priority, granted));
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(limiter.queue_len(), 3);

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        *order.lock(),
        vec![(Priority::High, true), (Priority::Normal, true), (Priority::Low, true)]
    );
    limiter.shutdown();
}

#[tokio::test]
async fn test_sliding_window_admits_limit_per_window() {
    let limiter = RateLimiter::new(
        "window",
        RateLimiterConfig {
            strategy: RateLimitStrategy::SlidingWindow,
            max_requests: 5,
            window_ms: 200,
            enable_queue: false,
            ..Default::default()
        },
    )
    .unwrap();

    let admitted = (0..8).filter(|_| limiter.try_acquire(Priority::Normal)).count();
    assert_eq!(admitted, 5);
    assert!(!limiter.acquire(Priority::Critical, None).await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(limiter.try_acquire(Priority::Normal));

    let metrics = limiter.get_metrics();
    assert_eq!(metrics.allowed_requests, 6);
    assert_eq!(metrics.rejected_requests, 4);
}

#[tokio::test]
async fn test_weighted_selection_through_pool() {
    let lb = LoadBalancer::new(
        "weighted",
        LoadBalancerConfig {
            algorithm: LoadBalancingAlgorithm::WeightedRoundRobin,
            instances: vec![common::instance("light", 8001, 1.0), common::instance("heavy", 8002, 2.0)],
            ..Default::default()
        },
    )
    .unwrap();

    for _ in 0..300 {
        let lease = lb.acquire(None).unwrap();
        lease.release(Duration::from_millis(5), true);
    }

    let light = lb.instance("light").unwrap();
    let heavy = lb.instance("heavy").unwrap();
    assert_eq!(light.total_requests, 100);
    assert_eq!(heavy.total_requests, 200);
    assert_eq!(light.current_connections + heavy.current_connections, 0);
}

#[tokio::test]
async fn test_unhealthy_instance_is_skipped_until_recovered() {
    let lb = LoadBalancer::new(
        "recovering",
        LoadBalancerConfig {
            max_failures: 2,
            recovery_time_ms: 50,
            instances: vec![common::instance("a", 8001, 1.0), common::instance("b", 8002, 1.0)],
            ..Default::default()
        },
    )
    .unwrap();

    let only_a = SelectionContext::excluding(["b"]);
    for _ in 0..2 {
        let lease = lb.acquire(Some(&only_a)).unwrap();
        assert_eq!(lease.instance().id, "a");
        lease.release(Duration::from_millis(5), false);
    }
    assert_eq!(lb.instance("a").unwrap().status, InstanceStatus::Unhealthy);

    for _ in 0..4 {
        assert_eq!(lb.select_instance(None).unwrap().id, "b");
        assert!(lb.release_instance("b", Duration::from_millis(1), true));
    }
    assert!(lb.acquire(Some(&only_a)).is_none());

    lb.register_health_check("tcp", |_instance| async { Ok(true) });
    lb.run_health_checks().await;
    assert_eq!(
        lb.instance("a").unwrap().status,
        InstanceStatus::Unhealthy,
        "recovery waits for recovery_time"
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    lb.run_health_checks().await;
    assert_eq!(lb.instance("a").unwrap().status, InstanceStatus::Healthy);
    assert_eq!(lb.acquire(Some(&only_a)).unwrap().instance().id, "a");
}

#[tokio::test]
async fn test_connection_limit_under_concurrent_calls() {
    let mut config = common::base_config("capped");
    config.retry.enabled = false;
    let mut only = common::instance("solo", 8001, 1.0);
    only.max_connections = 2;
    config.load_balancer.instances = vec![only];
    let manager = ReliabilityManager::new(config).unwrap();

    let call = || {
        manager.execute_with_protection(Priority::Normal, |_instance| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, ReliabilityError>(())
        })
    };
    let (a, b, c, d) = tokio::join!(call(), call(), call(), call());

    let results = [a, b, c, d];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(ReliabilityError::NoInstanceAvailable { .. })))
            .count(),
        2
    );

    let metrics = manager.get_metrics();
    assert_eq!(metrics.no_instance_requests, 2);
    assert_eq!(metrics.load_balancer.unwrap().instances[0].current_connections, 0);
}
