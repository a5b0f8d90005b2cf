//! Integration tests for circuit breaking under live traffic.
//!
//! Drives the full forwarding pipeline against backends that fail on
//! demand, verifying that circuits trip after the failure budget, hold
//! through the cooldown, and close again after a successful half-open
//! trial.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use hyper::StatusCode;
use bulwark::{BreakerConfig, CircuitState, LoadBalancer, StrategyKind, handle_request};

fn short_breaker() -> BreakerConfig {
    BreakerConfig {
        max_failures: 5,
        open_timeout: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn failing_upstream_trips_open_and_traffic_shifts() {
    init_tracing();
    let (flaky_url, flaky_healthy, _s1) = start_toggle_backend("flaky").await;
    let (good_url, good_count, _s2) = start_counting_backend(StatusCode::OK, "good").await;

    flaky_healthy.store(false, Ordering::SeqCst);

    let balancer = LoadBalancer::new(
        make_pool_with_breaker(&[flaky_url, good_url], short_breaker()),
        StrategyKind::RoundRobin,
    );
    let flaky = balancer.pool().all()[0].clone();

    // Every GET that lands on the failing upstream records a failure and
    // retries onto the good one, so clients always see 200.
    for _ in 0..10 {
        let resp = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert_eq!(flaky.circuit_state(), CircuitState::Open);
    assert!(!flaky.is_alive());
    assert!(good_count.load(Ordering::SeqCst) >= 10);
}

#[tokio::test]
async fn open_circuit_closes_after_cooldown_and_successful_trial() {
    init_tracing();
    let (flaky_url, flaky_healthy, _s1) = start_toggle_backend("flaky").await;
    let (good_url, _good_count, _s2) = start_counting_backend(StatusCode::OK, "good").await;

    flaky_healthy.store(false, Ordering::SeqCst);

    let balancer = LoadBalancer::new(
        make_pool_with_breaker(&[flaky_url, good_url], short_breaker()),
        StrategyKind::RoundRobin,
    );
    let flaky = balancer.pool().all()[0].clone();

    for _ in 0..6 {
        let resp = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(flaky.circuit_state(), CircuitState::Open);

    // While open and cooling down, the upstream is skipped entirely.
    assert!(!flaky.check_circuit_state());

    // Recover the backend, let the cooldown pass, then drive traffic so
    // round-robin trials the open circuit.
    flaky_healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(flaky.can_attempt_half_open());

    for _ in 0..4 {
        let resp = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert_eq!(flaky.circuit_state(), CircuitState::Closed);
    assert_eq!(flaky.failure_count(), 0);
}

#[tokio::test]
async fn failed_half_open_trial_reopens_the_circuit() {
    init_tracing();
    let (flaky_url, flaky_healthy, _s1) = start_toggle_backend("flaky").await;
    let (good_url, _good_count, _s2) = start_counting_backend(StatusCode::OK, "good").await;

    flaky_healthy.store(false, Ordering::SeqCst);

    let balancer = LoadBalancer::new(
        make_pool_with_breaker(&[flaky_url, good_url], short_breaker()),
        StrategyKind::RoundRobin,
    );
    let flaky = balancer.pool().all()[0].clone();

    for _ in 0..6 {
        let _ = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
    }
    assert_eq!(flaky.circuit_state(), CircuitState::Open);

    // Cooldown passes but the backend is still broken: the trial fails
    // and the circuit re-opens with a fresh cooldown.
    tokio::time::sleep(Duration::from_millis(350)).await;

    for _ in 0..4 {
        let resp = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "retry shields the client");
    }

    assert_eq!(flaky.circuit_state(), CircuitState::Open);
    assert!(!flaky.check_circuit_state());
}

#[tokio::test]
async fn transport_failures_count_against_the_same_budget() {
    init_tracing();
    let (good_url, _count, _s) = start_counting_backend(StatusCode::OK, "good").await;

    let balancer = LoadBalancer::new(
        make_pool_with_breaker(
            &[refused_addr(), good_url],
            BreakerConfig {
                max_failures: 3,
                open_timeout: Duration::from_secs(60),
            },
        ),
        StrategyKind::RoundRobin,
    );
    let refused = balancer.pool().all()[0].clone();

    for _ in 0..6 {
        let resp = handle_request(
            get_request("/"),
            test_client(),
            balancer.clone(),
            test_metrics(),
            test_addr(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert_eq!(refused.circuit_state(), CircuitState::Open);
}
