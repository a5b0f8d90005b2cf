//! Per-upstream runtime state: liveness, circuit breaking, connection and
//! latency tracking.
//!
//! Each origin server is represented by an [`UpstreamState`] holding its
//! parsed URI, static weight, and mutable runtime counters. The liveness
//! flag and in-flight connection count are plain atomics; the circuit
//! breaker fields (state, consecutive failures, last-failure timestamp,
//! latency average) form a compound that must transition atomically, so
//! they live behind a single short [`Mutex`] that is never held across I/O.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ValidatedUpstream;

/// Consecutive failures (probe or forwarded request, one shared budget)
/// required to trip the breaker open.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Cooldown an open circuit must observe before a trial request is allowed.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reserved: how long a backend may sit in half-open before being abandoned
/// back to open. Not currently enforced.
pub const HALF_OPEN_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Smoothing factor for the latency moving average.
const LATENCY_ALPHA: f64 = 0.2;

/// The three circuit breaker states gating dispatch to an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; eligibility follows the liveness flag.
    Closed,
    /// Tripped; requests are refused until the cooldown elapses.
    Open,
    /// A single trial request decides whether to close or re-open.
    HalfOpen,
}

/// Tunables for the per-upstream circuit breaker.
///
/// `max_failures` counts probe failures and forwarded-request failures
/// against the same budget: an upstream that fails five health checks is
/// just as tripped as one that fails five requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// The compound breaker state. All transitions happen under one lock so
/// the failure-count increment and the trip check are a single critical
/// section.
#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    avg_latency: Duration,
}

/// Manages the full set of upstream backends.
///
/// The pool is built once at startup and never resized; selectors, the
/// health checker, and the forwarder iterate it lock-free.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    backends: Arc<Vec<UpstreamState>>,
}

/// Runtime state for a single upstream backend. Cloning is cheap and all
/// clones observe the same state.
#[derive(Debug, Clone)]
pub struct UpstreamState {
    state: Arc<InnerState>,
}

#[derive(Debug)]
struct InnerState {
    /// The validated upstream URI.
    uri: hyper::Uri,
    /// Relative weight for load balancing.
    weight: u32,
    breaker_config: BreakerConfig,
    /// Written only by the health checker.
    alive: AtomicBool,
    /// In-flight requests currently being forwarded to this upstream.
    active_conns: AtomicU32,
    breaker: Mutex<BreakerState>,
}

impl UpstreamPool {
    /// Constructs a pool from validated upstream configurations, marking
    /// all backends as initially alive with closed circuits.
    pub fn from_validated(upstreams: &[ValidatedUpstream], breaker: BreakerConfig) -> Self {
        let backends = upstreams
            .iter()
            .map(|u| UpstreamState::new(u, breaker))
            .collect();
        Self {
            backends: Arc::new(backends),
        }
    }

    /// Returns a slice of all backends, eligible or not.
    pub fn all(&self) -> &[UpstreamState] {
        &self.backends
    }

    /// Returns the total number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Returns `true` if no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl UpstreamState {
    /// Creates a new alive upstream with a closed circuit and no recorded
    /// samples.
    pub fn new(upstream: &ValidatedUpstream, breaker: BreakerConfig) -> Self {
        Self {
            state: Arc::new(InnerState {
                uri: upstream.uri.clone(),
                weight: upstream.weight,
                breaker_config: breaker,
                alive: AtomicBool::new(true),
                active_conns: AtomicU32::new(0),
                breaker: Mutex::new(BreakerState {
                    circuit: CircuitState::Closed,
                    failure_count: 0,
                    last_failure: None,
                    avg_latency: Duration::ZERO,
                }),
            }),
        }
    }

    fn breaker(&self) -> MutexGuard<'_, BreakerState> {
        self.state.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the upstream URI.
    pub fn uri(&self) -> &hyper::Uri {
        &self.state.uri
    }

    /// Returns the load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.state.weight
    }

    /// Returns the liveness of this upstream: `false` while the circuit is
    /// open, otherwise the health checker's verdict.
    pub fn is_alive(&self) -> bool {
        if self.breaker().circuit == CircuitState::Open {
            return false;
        }
        self.state.alive.load(Ordering::Acquire)
    }

    /// Sets the liveness flag. The health checker is the only caller.
    pub fn set_alive(&self, alive: bool) {
        self.state.alive.store(alive, Ordering::Release);
    }

    /// Records a successful outcome: zeroes the failure counter and, if
    /// the circuit was half-open, closes it.
    ///
    /// Does not touch the liveness flag. The health checker is the sole
    /// writer of `alive`, so a single request success cannot mask an
    /// ongoing health-check failure.
    pub fn record_success(&self) {
        let mut b = self.breaker();
        b.failure_count = 0;
        if b.circuit == CircuitState::HalfOpen {
            b.circuit = CircuitState::Closed;
        }
    }

    /// Records a failed outcome from any source (health probe or forwarded
    /// request): increments the shared failure counter, stamps the failure
    /// time, and trips the circuit when the budget is exhausted. A failed
    /// half-open trial re-opens immediately.
    pub fn record_failure(&self) {
        let mut b = self.breaker();
        b.failure_count = b.failure_count.saturating_add(1);
        b.last_failure = Some(Instant::now());

        match b.circuit {
            CircuitState::Closed if b.failure_count >= self.state.breaker_config.max_failures => {
                b.circuit = CircuitState::Open;
            }
            CircuitState::HalfOpen => {
                b.circuit = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// The dispatch-eligibility gate.
    ///
    /// - Closed: eligible iff the health checker considers it alive.
    /// - HalfOpen: eligible (the trial request is in flight or imminent).
    /// - Open: eligible iff the cooldown has elapsed, signalling "may be
    ///   trialed" without mutating state here.
    pub fn check_circuit_state(&self) -> bool {
        let b = self.breaker();
        match b.circuit {
            CircuitState::Open => self.cooldown_elapsed(&b),
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.state.alive.load(Ordering::Acquire),
        }
    }

    /// Returns `true` if the open-state cooldown has elapsed and a trial
    /// request may be attempted.
    pub fn can_attempt_half_open(&self) -> bool {
        let b = self.breaker();
        self.cooldown_elapsed(&b)
    }

    fn cooldown_elapsed(&self, b: &BreakerState) -> bool {
        b.last_failure
            .is_none_or(|at| at.elapsed() >= self.state.breaker_config.open_timeout)
    }

    /// Transitions the circuit to half-open ahead of a trial request.
    pub fn set_circuit_half_open(&self) {
        self.breaker().circuit = CircuitState::HalfOpen;
    }

    /// Returns the current circuit state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker().circuit
    }

    /// Returns the current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.breaker().failure_count
    }

    /// Folds a request duration into the latency moving average. The first
    /// sample replaces the zero initializer outright.
    pub fn record_latency(&self, sample: Duration) {
        let mut b = self.breaker();
        if b.avg_latency.is_zero() {
            b.avg_latency = sample;
            return;
        }
        let blended =
            (1.0 - LATENCY_ALPHA) * b.avg_latency.as_secs_f64() + LATENCY_ALPHA * sample.as_secs_f64();
        b.avg_latency = Duration::from_secs_f64(blended);
    }

    /// Returns the latency moving average; zero until the first sample.
    pub fn avg_latency(&self) -> Duration {
        self.breaker().avg_latency
    }

    /// Marks one more request in flight to this upstream.
    pub fn inc_connections(&self) {
        self.state.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one request as finished, saturating at zero.
    pub fn dec_connections(&self) {
        let _ = self
            .state
            .active_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Returns the number of requests currently in flight.
    pub fn active_connections(&self) -> u32 {
        self.state.active_conns.load(Ordering::Acquire)
    }
}
