//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers (fixed-status, counting,
//! health-toggleable, slow), pool and balancer builders, client
//! constructors, and utility functions used across all integration test
//! modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use bulwark::{
    BoxBody, BreakerConfig, HttpClient, LoadBalancer, Metrics, StrategyKind, UpstreamPool,
    ValidatedUpstream,
};

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .build(hyper_util::client::legacy::connect::HttpConnector::new())
}

pub fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().expect("metrics must initialize"))
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// An address that refuses TCP connections immediately (port 1 is closed
/// on loopback in test environments).
pub fn refused_addr() -> String {
    "http://127.0.0.1:1".to_owned()
}

/// Builds a pool over the given upstream URLs with the default breaker.
pub fn make_pool(urls: &[String]) -> UpstreamPool {
    make_pool_with_breaker(urls, BreakerConfig::default())
}

/// Builds a pool with explicit breaker tunables, so tests can trip and
/// cool circuits without multi-second sleeps.
pub fn make_pool_with_breaker(urls: &[String], breaker: BreakerConfig) -> UpstreamPool {
    let validated = urls
        .iter()
        .map(|url| ValidatedUpstream {
            uri: url.parse().expect("test upstream URL must parse"),
            weight: 1,
        })
        .collect::<Vec<_>>();
    UpstreamPool::from_validated(&validated, breaker)
}

/// Builds a round-robin balancer over the given upstream URLs.
pub fn round_robin(urls: &[String]) -> LoadBalancer {
    LoadBalancer::new(make_pool(urls), StrategyKind::RoundRobin)
}

/// Builds a GET request for the proxy pipeline.
pub fn get_request(path: &str) -> Request<http_body_util::Empty<Bytes>> {
    Request::builder()
        .method(hyper::Method::GET)
        .uri(format!("http://any-host{path}"))
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap()
}

/// Builds a POST request with the given body for the proxy pipeline.
pub fn post_request(path: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("http://any-host{path}"))
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Starts a local HTTP server that responds to every request with the
/// given status and body. Returns the server URL and a shutdown handle.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (String, oneshot::Sender<()>) {
    let (url, _count, tx) = start_counting_backend(status, body).await;
    (url, tx)
}

/// Starts a backend that additionally counts the requests it serves.
pub async fn start_counting_backend(
    status: StatusCode,
    body: &'static str,
) -> (String, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let count = Arc::new(AtomicUsize::new(0));
    let count_inner = Arc::clone(&count);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let count = Arc::clone(&count_inner);
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (format!("http://{addr}"), count, tx)
}

/// Starts a backend whose `/healthz` endpoint follows a toggleable flag:
/// 200 "ok" while healthy, 503 "unhealthy" otherwise. Every other path
/// answers 200 with the given body while healthy and 502 otherwise.
pub async fn start_toggle_backend(
    body: &'static str,
) -> (String, Arc<AtomicBool>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let healthy = Arc::new(AtomicBool::new(true));
    let healthy_inner = Arc::clone(&healthy);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let healthy = Arc::clone(&healthy_inner);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let healthy = Arc::clone(&healthy);
                        async move {
                            let up = healthy.load(Ordering::SeqCst);
                            let (status, text) = match (req.uri().path(), up) {
                                ("/healthz", true) => (StatusCode::OK, "ok"),
                                ("/healthz", false) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
                                (_, true) => (StatusCode::OK, body),
                                (_, false) => (StatusCode::BAD_GATEWAY, "down"),
                            };
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from(text)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (format!("http://{addr}"), healthy, tx)
}

/// Starts a backend that captures and echoes request headers as the
/// response body, one `name: value` line per header, sorted.
pub async fn start_echo_headers_backend() -> (String, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = Vec::new();
                        for (name, value) in req.headers() {
                            if let Ok(v) = value.to_str() {
                                lines.push(format!("{}: {}", name.as_str(), v));
                            }
                        }
                        lines.sort();
                        let body = lines.join("\n");
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (format!("http://{addr}"), tx)
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (String, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        tokio::time::sleep(delay).await;
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from("slow")))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (format!("http://{addr}"), tx)
}

/// Polls `predicate` every 10ms until it holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
