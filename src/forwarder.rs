//! Core request forwarding: selection, circuit gating, header rewriting,
//! dispatch, outcome recording, and idempotent retry.
//!
//! The pipeline per attempt:
//!
//! 1. **Selection** — Ask the balancer for one eligible upstream; with
//!    none available the client receives 503.
//! 2. **Eligibility gate** — Re-run the circuit check on the chosen
//!    upstream. Selection already filtered, but the gate must be re-run
//!    against the exact request that trials an open circuit.
//! 3. **Half-open transition** — An open circuit whose cooldown has
//!    elapsed is moved to half-open here, so the request about to be sent
//!    is the trial that decides the circuit's fate.
//! 4. **Header rewriting** — Hop-by-hop headers are stripped per RFC 7230
//!    Section 6.1, the client IP is appended to `X-Forwarded-For`, an
//!    `X-Request-ID` is minted if absent, and `Host` plus the URI are
//!    rewritten to target the upstream.
//! 5. **Dispatch** — The request goes out on the shared pooled client
//!    with a response-header deadline.
//! 6. **Outcome recording** — Transport failures and gateway-class
//!    statuses (502/503/504) count against the upstream's failure budget;
//!    any other response counts as a success. Connection and latency
//!    accounting happen on every path.
//!
//! GET, HEAD, and OPTIONS requests may take up to three attempts, with
//! the balancer re-queried each time; their bodies are buffered up front
//! so attempts can be re-issued. All other methods take exactly one
//! attempt. Upstream responses outside the retryable set are relayed
//! verbatim, whatever their status.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, warn};

use crate::metrics::Metrics;
use crate::upstream::{CircuitState, UpstreamState};
use crate::{LoadBalancer, ProxyError, Result, headers};

/// Boxed error type threaded through response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type produced by the proxy for both relayed and synthesized
/// responses.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// The plain-HTTP client type used for upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// The HTTPS-capable client type used when any upstream speaks TLS.
pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

/// TCP connect deadline for upstream dials.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// TCP keep-alive interval on upstream connections.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How long an idle pooled connection is kept around.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle connection cap per upstream host.
const MAX_IDLE_PER_HOST: usize = 10;
/// Deadline for the upstream to produce response headers. Also bounds the
/// TLS handshake for `https://` upstreams.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
/// Total attempts permitted for idempotent methods (one initial plus two
/// retries).
const MAX_ATTEMPTS: usize = 3;

/// Builds the shared connection-pooled client for plain-HTTP upstreams.
pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build(tuned_connector())
}

/// Builds the shared client with TLS origination support; plain `http://`
/// upstreams pass through unmodified.
pub fn build_https_client() -> HttpsClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build(crate::tls::build_https_connector())
}

pub(crate) fn tuned_connector() -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    connector.set_keepalive(Some(KEEPALIVE_INTERVAL));
    connector
}

/// Wraps bytes in a [`BoxBody`].
pub fn full(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

/// The error produced when a [`CappedBody`] crosses its byte limit.
#[derive(Debug)]
pub struct BodyLimitExceeded {
    pub limit: u64,
}

impl fmt::Display for BodyLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request body exceeded {} bytes", self.limit)
    }
}

impl std::error::Error for BodyLimitExceeded {}

/// A body wrapper that counts the bytes actually read and errors once
/// they cross `limit`.
///
/// The declared `Content-Length` check in the server rejects honest
/// oversized requests early, but a chunked or undeclared body bypasses
/// it; this wrapper enforces the cap on the real stream, so the buffered
/// retry path never holds more than `limit` bytes and streamed uploads
/// are cut off at the cap.
pub struct CappedBody<B> {
    inner: B,
    remaining: u64,
    limit: u64,
}

impl<B> CappedBody<B> {
    pub fn new(inner: B, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            limit,
        }
    }
}

impl<B> Body for CappedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let frame = match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => frame,
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
        };

        if let Some(data) = frame.data_ref() {
            let len = data.len() as u64;
            if len > this.remaining {
                let err = BodyLimitExceeded { limit: this.limit };
                return Poll::Ready(Some(Err(Box::new(err))));
            }
            this.remaining -= len;
        }

        Poll::Ready(Some(Ok(frame)))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Walks an error's source chain looking for a body-limit violation,
/// returning the violated limit if one is found.
fn body_limit_error(e: &(dyn std::error::Error + 'static)) -> Option<u64> {
    let mut current = Some(e);
    while let Some(err) = current {
        if let Some(exceeded) = err.downcast_ref::<BodyLimitExceeded>() {
            return Some(exceeded.limit);
        }
        current = err.source();
    }
    None
}

/// Processes a single inbound request through the forwarding pipeline,
/// returning either the relayed upstream response or an error that maps
/// to the appropriate client-facing status.
pub async fn handle_request<C, B>(
    req: Request<B>,
    client: Client<C, BoxBody>,
    balancer: LoadBalancer,
    metrics: Arc<Metrics>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    C: Connect + Clone + Send + Sync + 'static,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    metrics.record_request();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let (mut parts, body) = req.into_parts();

    let request_id = headers::ensure_request_id(&mut parts.headers);
    let span = tracing::info_span!(
        "request",
        id = %request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        headers::strip_hop_by_hop(&mut parts.headers);
        headers::append_forwarded_for(&mut parts.headers, client_addr);

        let retryable_method = is_retryable_method(&method);
        let max_attempts = if retryable_method { MAX_ATTEMPTS } else { 1 };

        // Idempotent requests may be re-issued, so their (typically empty)
        // bodies are buffered. Everything else streams straight through.
        let mut buffered: Option<Bytes> = None;
        let mut streaming: Option<B> = None;
        if retryable_method {
            let collected = match body.collect().await {
                Ok(collected) => collected,
                Err(e) => {
                    let e: BoxError = e.into();
                    if let Some(limit) = body_limit_error(e.as_ref()) {
                        return Err(ProxyError::BodyTooLarge { limit });
                    }
                    return Err(ProxyError::Internal(format!(
                        "failed to read request body: {e}"
                    )));
                }
            };
            buffered = Some(collected.to_bytes());
        } else {
            streaming = Some(body);
        }

        let mut last_response: Option<Response<hyper::body::Incoming>> = None;

        for attempt in 1..=max_attempts {
            let upstream = match balancer.next(None) {
                Ok(upstream) => upstream,
                Err(e) => {
                    // Every retry would re-observe the same empty pool, so
                    // surface the last retryable status if one was seen.
                    if let Some(resp) = last_response.take() {
                        warn!(attempt, "pool exhausted mid-retry, relaying last upstream status");
                        return Ok(relay_response(resp));
                    }
                    return Err(e);
                }
            };

            if !upstream.check_circuit_state() {
                if let Some(resp) = last_response.take() {
                    return Ok(relay_response(resp));
                }
                return Err(ProxyError::BackendUnavailable);
            }

            if upstream.circuit_state() == CircuitState::Open && upstream.can_attempt_half_open() {
                info!(upstream = %upstream.uri(), "cooldown elapsed, trialing half-open circuit");
                upstream.set_circuit_half_open();
            }

            let attempt_body = match &buffered {
                Some(bytes) => full(bytes.clone()),
                None => match streaming.take() {
                    Some(body) => body.map_err(Into::into).boxed(),
                    None => {
                        return Err(ProxyError::Internal("request body already consumed".into()));
                    }
                },
            };

            let proxy_req =
                build_attempt_request(&method, &uri, &parts.headers, upstream.uri(), attempt_body)?;

            debug!(
                upstream = %upstream.uri(),
                attempt,
                upstream_uri = %proxy_req.uri(),
                "forwarding request"
            );

            let in_flight = InFlight::begin(&upstream, &metrics);

            let result = timeout(RESPONSE_HEADER_TIMEOUT, client.request(proxy_req)).await;

            let elapsed = in_flight.elapsed();
            drop(in_flight);

            match result {
                Ok(Ok(resp)) if is_retryable_status(resp.status()) => {
                    upstream.record_failure();
                    metrics.record_backend_failure(upstream.uri());
                    warn!(
                        upstream = %upstream.uri(),
                        status = resp.status().as_u16(),
                        attempt,
                        "upstream returned gateway error"
                    );
                    if attempt < max_attempts {
                        last_response = Some(resp);
                        continue;
                    }
                    return Ok(relay_response(resp));
                }
                Ok(Ok(resp)) => {
                    upstream.record_success();
                    info!(
                        upstream = %upstream.uri(),
                        status = resp.status().as_u16(),
                        latency_ms = elapsed.as_millis() as u64,
                        attempt,
                        "upstream responded"
                    );
                    return Ok(relay_response(resp));
                }
                Ok(Err(e)) => {
                    // An oversized client body aborts the dispatch mid-send;
                    // that is the client's fault, not the upstream's.
                    if let Some(limit) = body_limit_error(&e) {
                        warn!(limit, "request body exceeded limit mid-stream");
                        return Err(ProxyError::BodyTooLarge { limit });
                    }
                    upstream.record_failure();
                    metrics.record_backend_failure(upstream.uri());
                    warn!(
                        upstream = %upstream.uri(),
                        error = %e,
                        attempt,
                        "upstream request failed"
                    );
                    if attempt < max_attempts {
                        continue;
                    }
                    return Err(ProxyError::Upstream(e.to_string()));
                }
                Err(_elapsed) => {
                    upstream.record_failure();
                    metrics.record_backend_failure(upstream.uri());
                    warn!(
                        upstream = %upstream.uri(),
                        timeout = ?RESPONSE_HEADER_TIMEOUT,
                        attempt,
                        "upstream timed out before response headers"
                    );
                    if attempt < max_attempts {
                        continue;
                    }
                    return Err(ProxyError::Timeout(RESPONSE_HEADER_TIMEOUT));
                }
            }
        }

        Err(ProxyError::Internal("retry loop exhausted without outcome".into()))
    }
    .instrument(span)
    .await
}

/// Connection and latency accounting for one attempt.
///
/// Dropping the guard performs the bookkeeping, so a client disconnect
/// that cancels the request future mid-dispatch still decrements the
/// connection count and records the observed duration.
struct InFlight {
    upstream: UpstreamState,
    metrics: Arc<Metrics>,
    start: Instant,
}

impl InFlight {
    fn begin(upstream: &UpstreamState, metrics: &Arc<Metrics>) -> Self {
        upstream.inc_connections();
        metrics.inc_active();
        Self {
            upstream: upstream.clone(),
            metrics: Arc::clone(metrics),
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.upstream.dec_connections();
        self.upstream.record_latency(elapsed);
        self.metrics.dec_active();
        self.metrics.observe_duration(elapsed);
    }
}

/// Returns `true` for methods safe to re-issue against another upstream.
fn is_retryable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Returns `true` for gateway-class statuses that mark the upstream as
/// having failed the request.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Builds one outbound attempt targeting `upstream`, carrying the shared
/// prepared headers with `Host` rewritten to the upstream authority.
fn build_attempt_request(
    method: &Method,
    original_uri: &Uri,
    prepared_headers: &HeaderMap,
    upstream: &Uri,
    body: BoxBody,
) -> Result<Request<BoxBody>> {
    let target = rewrite_uri(original_uri, upstream)?;
    let authority = upstream
        .authority()
        .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no authority".into()))?;

    let mut req = Request::builder()
        .method(method.clone())
        .uri(target)
        .body(body)?;
    *req.headers_mut() = prepared_headers.clone();
    headers::rewrite_host(req.headers_mut(), authority);

    Ok(req)
}

/// Rewrites the original request URI to target the chosen upstream,
/// preserving the path and query string.
fn rewrite_uri(original: &Uri, upstream: &Uri) -> Result<Uri> {
    let authority = upstream
        .authority()
        .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no authority".into()))?;

    let scheme = upstream
        .scheme()
        .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no scheme".into()))?;

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream URI: {e}")))
}

/// Strips hop-by-hop headers from the upstream response and boxes its
/// body for relay to the client.
fn relay_response(resp: Response<hyper::body::Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = resp.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body.map_err(|e| Box::new(e) as BoxError).boxed())
}
