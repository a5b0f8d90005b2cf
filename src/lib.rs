//! A Layer-7 HTTP load-balancing reverse proxy built on [hyper] and [tokio].
//!
//! This crate fans a single ingress out across a pool of upstream origin
//! servers. It provides four selection strategies (round-robin,
//! least-connections, lowest-latency, consistent-hash), active health
//! probing, per-upstream circuit breaking, retry of idempotent requests
//! across upstreams, structured observability via [tracing], Prometheus
//! metrics, per-IP rate limiting, TLS termination, and graceful shutdown.
//!
//! Every inbound request is assigned a unique `X-Request-ID` and wrapped in
//! a [`tracing::Span`] carrying the request method, URI, and client address
//! as structured fields.
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/
//! [tracing]: https://docs.rs/tracing

pub mod balancer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod tls;
pub mod upstream;

pub use balancer::{LoadBalancer, StrategyKind};
pub use config::{
    Config, HealthCheckConfig, RateLimitConfig, RequestLimitConfig, RuntimeConfig, TlsConfig,
    ValidatedUpstream,
};
pub use error::ProxyError;
pub use forwarder::{
    BoxBody, BoxError, HttpClient, HttpsClient, build_client, build_https_client, handle_request,
};
pub use health::HealthChecker;
pub use metrics::Metrics;
pub use rate_limit::IpRateLimiter;
pub use upstream::{BreakerConfig, CircuitState, UpstreamPool, UpstreamState};

pub type Result<T> = std::result::Result<T, ProxyError>;
