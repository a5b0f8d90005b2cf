//! Active health checking.
//!
//! A single periodic loop probes every upstream's health endpoint and
//! updates its liveness flag and failure counters. Probe failures draw
//! from the same failure budget as forwarded-request failures, so an
//! upstream failing only its health checks will still trip the breaker.
//!
//! The checker never retries a probe; the next tick is the retry. It uses
//! its own HTTP client so probes never consume connection-pool slots from
//! forward-path traffic.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{info, warn};

use crate::config::HealthCheckConfig;
use crate::metrics::Metrics;
use crate::upstream::{UpstreamPool, UpstreamState};

/// Periodic prober over every upstream in the pool.
pub struct HealthChecker {
    pool: UpstreamPool,
    metrics: Arc<Metrics>,
    interval: Duration,
    timeout: Duration,
    path: String,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HealthChecker {
    /// Creates a checker with its own dedicated probe client.
    pub fn new(pool: UpstreamPool, config: &HealthCheckConfig, metrics: Arc<Metrics>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            pool,
            metrics,
            interval: config.interval,
            timeout: config.timeout,
            path: config.path.clone(),
            client,
        }
    }

    /// Spawns the probe loop. Each tick probes every upstream once;
    /// the loop exits when `shutdown` resolves.
    pub fn spawn(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_all().await,
                    () = &mut shutdown => {
                        info!("health checker stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn check_all(&self) {
        for backend in self.pool.all() {
            self.check_one(backend).await;
        }
    }

    /// Probes one upstream's health endpoint and applies the verdict:
    /// transport error, timeout, or status >= 500 is unhealthy; any other
    /// response (including 3xx/4xx) is healthy.
    async fn check_one(&self, backend: &UpstreamState) {
        let uri_str = format!(
            "{}://{}{}",
            backend.uri().scheme_str().unwrap_or("http"),
            backend
                .uri()
                .authority()
                .map(|a| a.as_str())
                .unwrap_or("localhost"),
            self.path,
        );

        let uri = match uri_str.parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(
                    upstream = %backend.uri(),
                    error = %e,
                    "failed to build health probe URI"
                );
                return;
            }
        };

        let result = tokio::time::timeout(self.timeout, self.client.get(uri)).await;

        match result {
            Ok(Ok(resp)) if resp.status().as_u16() < 500 => {
                let was_down = !backend.is_alive();
                backend.set_alive(true);
                backend.record_success();
                self.metrics.set_backend_health(backend.uri(), true);
                if was_down {
                    info!(upstream = %backend.uri(), "health probe passed, backend recovered");
                }
            }
            Ok(Ok(resp)) => {
                backend.set_alive(false);
                backend.record_failure();
                self.metrics.set_backend_health(backend.uri(), false);
                warn!(
                    upstream = %backend.uri(),
                    status = resp.status().as_u16(),
                    failures = backend.failure_count(),
                    "health probe returned server error"
                );
            }
            Ok(Err(e)) => {
                backend.set_alive(false);
                backend.record_failure();
                self.metrics.set_backend_health(backend.uri(), false);
                warn!(
                    upstream = %backend.uri(),
                    error = %e,
                    failures = backend.failure_count(),
                    "health probe failed"
                );
            }
            Err(_) => {
                backend.set_alive(false);
                backend.record_failure();
                self.metrics.set_backend_health(backend.uri(), false);
                warn!(
                    upstream = %backend.uri(),
                    timeout = ?self.timeout,
                    failures = backend.failure_count(),
                    "health probe timed out"
                );
            }
        }
    }
}
