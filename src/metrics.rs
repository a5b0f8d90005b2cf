//! Prometheus metrics: five named series plus the scrape endpoint.
//!
//! The collector owns its [`Registry`] so tests can create isolated
//! instances without global-registry collisions. The forwarder and health
//! checker update the series at fixed points; the scrape endpoint runs on
//! its own listener so operator traffic never mixes with proxied traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::forwarder::{BoxBody, full};
use crate::{ProxyError, Result};

/// The proxy's metric series.
pub struct Metrics {
    registry: Registry,
    /// Total number of HTTP requests processed by the proxy.
    requests_total: IntCounter,
    /// Failed requests per upstream, labeled by URL.
    backend_failures: IntCounterVec,
    /// Current number of in-flight proxied requests.
    active_connections: IntGauge,
    /// Request durations through the proxy.
    request_duration: Histogram,
    /// Per-upstream health, 1 healthy / 0 unhealthy, labeled by URL.
    backend_health: IntGaugeVec,
}

impl Metrics {
    /// Creates a collector with all five series registered against a
    /// fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::new(
            "bulwark_requests_total",
            "Total number of HTTP requests processed by the load balancer",
        )
        .map_err(internal)?;

        let backend_failures = IntCounterVec::new(
            Opts::new(
                "bulwark_backend_failures_total",
                "Number of failed requests per backend",
            ),
            &["backend"],
        )
        .map_err(internal)?;

        let active_connections = IntGauge::new(
            "bulwark_active_connections",
            "Current number of active proxied requests",
        )
        .map_err(internal)?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "bulwark_request_duration_seconds",
            "Histogram of request durations through the load balancer",
        ))
        .map_err(internal)?;

        let backend_health = IntGaugeVec::new(
            Opts::new(
                "bulwark_backend_health",
                "Backend health status (1 = healthy, 0 = unhealthy)",
            ),
            &["backend"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(backend_failures.clone()),
            Box::new(active_connections.clone()),
            Box::new(request_duration.clone()),
            Box::new(backend_health.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            requests_total,
            backend_failures,
            active_connections,
            request_duration,
            backend_health,
        })
    }

    /// Counts one inbound request.
    pub fn record_request(&self) {
        self.requests_total.inc();
    }

    /// Counts one failed attempt against the given upstream.
    pub fn record_backend_failure(&self, backend: &hyper::Uri) {
        self.backend_failures
            .with_label_values(&[backend.to_string().as_str()])
            .inc();
    }

    pub fn inc_active(&self) {
        self.active_connections.inc();
    }

    pub fn dec_active(&self) {
        self.active_connections.dec();
    }

    /// Folds one request duration into the histogram.
    pub fn observe_duration(&self, elapsed: Duration) {
        self.request_duration.observe(elapsed.as_secs_f64());
    }

    /// Publishes the health checker's verdict for one upstream.
    pub fn set_backend_health(&self, backend: &hyper::Uri, healthy: bool) {
        self.backend_health
            .with_label_values(&[backend.to_string().as_str()])
            .set(i64::from(healthy));
    }

    /// Renders every registered series in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn internal(e: prometheus::Error) -> ProxyError {
    ProxyError::Internal(format!("metrics registration failed: {e}"))
}

/// Spawns the scrape endpoint on its own listener, serving the text
/// encoding at `/metrics` until `shutdown` resolves. Bind failures are
/// logged rather than fatal; the proxy keeps serving without metrics.
pub fn spawn_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        info!(%addr, "metrics server listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept metrics connection");
                            continue;
                        }
                    };

                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let metrics = Arc::clone(&metrics);
                            async move {
                                Ok::<_, std::convert::Infallible>(scrape_response(&req, &metrics))
                            }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            warn!(error = %e, "metrics connection error");
                        }
                    });
                }
                () = &mut shutdown => break,
            }
        }
    })
}

fn scrape_response(
    req: &Request<hyper::body::Incoming>,
    metrics: &Metrics,
) -> Response<BoxBody> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("not found"))
            .unwrap_or_else(|_| Response::new(full("")));
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(full(metrics.render()))
        .unwrap_or_else(|_| Response::new(full("")))
}
