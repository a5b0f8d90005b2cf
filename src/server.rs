//! Server accept loop, reserved endpoints, and graceful shutdown.
//!
//! Contains the runtime infrastructure between the TCP listener and the
//! per-request forwarding pipeline. Two reserved paths are answered by
//! the proxy itself — `/healthz` (its own liveness) and `/readyz`
//! (readiness, requiring a non-empty upstream pool) — and everything
//! else is proxied. Rate limiting and request limits are enforced here,
//! ahead of the forwarder, so rejected requests never touch the pool.
//!
//! This module is decoupled from `main()` so the server logic stays
//! testable without process-level concerns like signal handling or
//! `std::process::exit`.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::Connect;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RequestLimitConfig;
use crate::forwarder::{BoxBody, CappedBody, full, handle_request};
use crate::metrics::Metrics;
use crate::rate_limit::IpRateLimiter;
use crate::{LoadBalancer, ProxyError, Result, RuntimeConfig, headers};

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Validated proxy configuration shared by all handlers.
    pub config: Arc<RuntimeConfig>,
    /// Balancer over the upstream pool.
    pub balancer: LoadBalancer,
    /// Metrics collector updated along the request path.
    pub metrics: Arc<Metrics>,
    /// Per-IP rate limiter. `None` disables rate limiting.
    pub rate_limiter: Option<IpRateLimiter>,
    /// TLS acceptor for client-facing connections. `None` means plain HTTP.
    pub tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

/// Accepts connections on `listener`, optionally wrapping each in TLS,
/// and dispatches them through the proxy pipeline using the given
/// `client` and shared `state`. Generic over the client connector type so
/// plain-HTTP and HTTPS upstreams use the same accept loop.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue to
/// completion independently.
pub async fn serve<C>(
    listener: TcpListener,
    client: Client<C, BoxBody>,
    state: ServerState,
    shutdown: impl Future<Output = ()>,
) where
    C: Connect + Clone + Send + Sync + 'static,
{
    let ServerState {
        config,
        balancer,
        metrics,
        rate_limiter,
        tls_acceptor,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let client = client.clone();
                let config = Arc::clone(&config);
                let metrics = Arc::clone(&metrics);
                let balancer = balancer.clone();
                let rate_limiter = rate_limiter.clone();
                let tls_acceptor = tls_acceptor.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let client = client.clone();
                        let config = Arc::clone(&config);
                        let metrics = Arc::clone(&metrics);
                        let balancer = balancer.clone();
                        let rate_limiter = rate_limiter.clone();
                        async move {
                            let resp = dispatch(
                                req,
                                client,
                                config,
                                balancer,
                                metrics,
                                rate_limiter,
                                client_addr,
                            )
                            .await;
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    let builder = http1::Builder::new();

                    let result = match tls_acceptor {
                        Some(acceptor) => {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!(%e, "TLS handshake failed");
                                    return;
                                }
                            };
                            builder
                                .serve_connection(TokioIo::new(tls_stream), svc)
                                .await
                        }
                        None => {
                            builder
                                .serve_connection(TokioIo::new(stream), svc)
                                .await
                        }
                    };

                    if let Err(e) = result {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Routes one inbound request: reserved paths are answered locally,
/// everything else passes the rate and request limits before reaching
/// the forwarder.
async fn dispatch<C>(
    req: Request<Incoming>,
    client: Client<C, BoxBody>,
    config: Arc<RuntimeConfig>,
    balancer: LoadBalancer,
    metrics: Arc<Metrics>,
    rate_limiter: Option<IpRateLimiter>,
    client_addr: SocketAddr,
) -> Response<BoxBody>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let path = req.uri().path();
    if path == "/healthz" {
        return liveness_response();
    }
    if path == "/readyz" {
        return readiness_response(!balancer.pool().is_empty());
    }

    if let Some(limiter) = &rate_limiter {
        if let Err(retry_after_ms) = limiter.check(&client_addr.ip()) {
            warn!(client = %client_addr, retry_after_ms, "rate limit exceeded");
            return ProxyError::RateLimited { retry_after_ms }.into_response();
        }
    }

    match config.request_limits {
        Some(limits) => {
            if let Err(e) = enforce_request_limits(req.headers(), &limits) {
                warn!(client = %client_addr, error = %e, "request rejected");
                return e.into_response();
            }
            // The header check above only catches declared lengths; the
            // cap on the actual stream holds regardless of what the
            // client claimed.
            let req = req.map(|body| CappedBody::new(body, limits.max_body_size));
            handle_request(req, client, balancer, metrics, client_addr).await
        }
        None => handle_request(req, client, balancer, metrics, client_addr).await,
    }
    .unwrap_or_else(ProxyError::into_response)
}

/// The proxy's own liveness endpoint: 200 unconditionally.
fn liveness_response() -> Response<BoxBody> {
    plain_response(StatusCode::OK, "ok")
}

/// The proxy's readiness endpoint: 200 iff the upstream pool is non-empty.
fn readiness_response(ready: bool) -> Response<BoxBody> {
    if ready {
        plain_response(StatusCode::OK, "ready")
    } else {
        plain_response(StatusCode::SERVICE_UNAVAILABLE, "no upstreams configured")
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full(body))
        .unwrap_or_else(|_| Response::new(full(body)))
}

/// Rejects smuggling attempts and oversized requests before forwarding.
fn enforce_request_limits(
    req_headers: &hyper::HeaderMap,
    limits: &RequestLimitConfig,
) -> Result<()> {
    if headers::is_smuggling_attempt(req_headers) {
        return Err(ProxyError::RequestSmuggling);
    }
    if headers::content_length_exceeds(req_headers, limits.max_body_size) {
        return Err(ProxyError::BodyTooLarge {
            limit: limits.max_body_size,
        });
    }
    if headers::header_size_exceeds(req_headers, limits.max_header_size) {
        return Err(ProxyError::HeadersTooLarge {
            limit: limits.max_header_size,
        });
    }
    Ok(())
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::{HeaderName, HeaderValue};

    use super::*;

    #[test]
    fn liveness_always_ok() {
        let resp = liveness_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn readiness_follows_pool_state() {
        assert_eq!(readiness_response(true).status(), StatusCode::OK);
        assert_eq!(
            readiness_response(false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    fn header_map(pairs: &[(&str, &str)]) -> hyper::HeaderMap {
        pairs
            .iter()
            .fold(hyper::HeaderMap::new(), |mut map, (name, value)| {
                map.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
                map
            })
    }

    #[test]
    fn limits_reject_smuggling_attempt() {
        let limits = RequestLimitConfig::default();
        let headers = header_map(&[("content-length", "4"), ("transfer-encoding", "chunked")]);
        assert!(matches!(
            enforce_request_limits(&headers, &limits),
            Err(ProxyError::RequestSmuggling)
        ));
    }

    #[test]
    fn limits_reject_oversized_body_and_headers() {
        let limits = RequestLimitConfig {
            max_body_size: 10,
            max_header_size: 64,
        };

        let big_body = header_map(&[("content-length", "11")]);
        assert!(matches!(
            enforce_request_limits(&big_body, &limits),
            Err(ProxyError::BodyTooLarge { .. })
        ));

        let padding = "a".repeat(80);
        let big_headers = header_map(&[("x-padding", padding.as_str())]);
        assert!(matches!(
            enforce_request_limits(&big_headers, &limits),
            Err(ProxyError::HeadersTooLarge { .. })
        ));
    }

    #[test]
    fn limits_allow_clean_request() {
        let limits = RequestLimitConfig::default();
        let headers = header_map(&[("content-length", "128"), ("accept", "*/*")]);
        assert!(enforce_request_limits(&headers, &limits).is_ok());
    }
}
