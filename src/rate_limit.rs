//! Per-IP rate limiting using the GCRA (Generic Cell Rate Algorithm).
//!
//! Wraps the [`governor`] crate's keyed rate limiter to enforce the
//! configured max-requests-per-window budget per client IP address. Each
//! unique IP gets its own cell state; the check itself is lock-free.
//!
//! Entries for IPs that have not been seen recently are pruned via
//! [`IpRateLimiter::retain_recent`], called from a background task so the
//! map does not grow without bound under high-cardinality traffic.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tracing::info;

use crate::config::RateLimitConfig;
use crate::{ProxyError, Result};

/// The concrete governor rate limiter type keyed by client IP address.
type InnerLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

/// A thread-safe, per-IP rate limiter backed by a GCRA token bucket.
///
/// Constructed once at startup and shared across all request handlers via
/// `Arc`. Requests over the limit receive the estimated wait time so the
/// 429 response can carry a `Retry-After` hint.
#[derive(Debug, Clone)]
pub struct IpRateLimiter {
    inner: Arc<InnerLimiter>,
}

impl IpRateLimiter {
    /// Creates a limiter allowing `max_requests` per `window` per IP,
    /// with the full budget available as burst.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let max = NonZeroU32::new(config.max_requests)
            .ok_or_else(|| ProxyError::Config("rate limit max must be non-zero".into()))?;
        if config.window.is_zero() {
            return Err(ProxyError::Config("rate limit window must be non-zero".into()));
        }

        let replenish = config.window / config.max_requests;
        let quota = Quota::with_period(replenish.max(Duration::from_nanos(1)))
            .ok_or_else(|| ProxyError::Config("rate limit window must be non-zero".into()))?
            .allow_burst(max);

        Ok(Self {
            inner: Arc::new(RateLimiter::dashmap(quota)),
        })
    }

    /// Checks whether the given IP address is within its budget.
    ///
    /// Returns `Ok(())` if the request is allowed, or `Err(retry_after_ms)`
    /// with the estimated wait in milliseconds if the limit is exceeded.
    pub fn check(&self, ip: &IpAddr) -> std::result::Result<(), u64> {
        self.inner.check_key(ip).map_err(|not_until| {
            not_until
                .wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
                .as_millis() as u64
        })
    }

    /// Drops state for IPs that have not been seen within the limiter's
    /// tracking window.
    pub fn retain_recent(&self) {
        self.inner.retain_recent();
    }

    /// Returns the number of IP addresses currently tracked.
    pub fn tracked_ip_count(&self) -> usize {
        self.inner.len()
    }
}

/// Spawns a background task that periodically prunes stale limiter
/// entries until `shutdown` resolves.
pub fn spawn_rate_limit_cleanup(
    limiter: IpRateLimiter,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let before = limiter.tracked_ip_count();
                    limiter.retain_recent();
                    let after = limiter.tracked_ip_count();
                    if before != after {
                        info!(before, after, pruned = before - after, "rate limiter cleanup");
                    }
                }
                () = &mut shutdown => break,
            }
        }
    })
}
