//! Configuration loading and validation.
//!
//! The proxy reads its configuration from `LB_*` environment variables
//! exactly once at startup, with CLI flags taking precedence for the
//! listen address and strategy. Loading is lenient (unparseable scalars
//! fall back to their defaults); [`Config::into_runtime`] then performs
//! the strict validation — every upstream URL must parse, weights must
//! align — and produces the immutable [`RuntimeConfig`] shared across all
//! request handlers.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::balancer::StrategyKind;
use crate::upstream::BreakerConfig;
use crate::{ProxyError, Result};

/// Default probe cadence for the health checker.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);
/// Default per-probe deadline.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
/// Default health endpoint path probed on each upstream.
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
/// Default cap on declared request body size (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
/// Default cap on total request header bytes.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;

/// Raw configuration as collected from the environment.
///
/// Field values are already typed but not yet validated; use
/// [`Config::into_runtime`] to obtain a [`RuntimeConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address the proxy listens on. A bare `:port` binds all interfaces.
    pub listen_addr: String,
    /// Upstream base URLs, in positional order.
    pub backends: Vec<String>,
    /// Per-upstream weights; empty means weight 1 for every upstream.
    pub weights: Vec<u32>,
    /// Selection strategy name.
    pub strategy: String,
    pub health: HealthCheckConfig,
    pub breaker: BreakerConfig,
    pub metrics_enabled: bool,
    pub metrics_addr: String,
    pub rate_limit_enabled: bool,
    pub rate_limit: RateLimitConfig,
    pub request_limit_enabled: bool,
    pub limits: RequestLimitConfig,
    pub tls_enabled: bool,
    pub tls: TlsConfig,
}

/// Health checker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            path: DEFAULT_HEALTH_PATH.to_owned(),
        }
    }
}

/// Per-IP rate limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Caps applied to inbound requests before they reach the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimitConfig {
    pub max_body_size: u64,
    pub max_header_size: usize,
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

/// TLS termination settings for the client-facing listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    /// Generate a self-signed certificate when the files are missing.
    pub auto_generate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "cert.pem".to_owned(),
            key_path: "key.pem".to_owned(),
            auto_generate: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_owned(),
            backends: Vec::new(),
            weights: Vec::new(),
            strategy: "round_robin".to_owned(),
            health: HealthCheckConfig::default(),
            breaker: BreakerConfig::default(),
            metrics_enabled: true,
            metrics_addr: ":9090".to_owned(),
            rate_limit_enabled: false,
            rate_limit: RateLimitConfig::default(),
            request_limit_enabled: false,
            limits: RequestLimitConfig::default(),
            tls_enabled: false,
            tls: TlsConfig::default(),
        }
    }
}

/// A validated upstream entry: absolute URI plus its balancing weight.
#[derive(Debug, Clone)]
pub struct ValidatedUpstream {
    pub uri: hyper::Uri,
    pub weight: u32,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via
/// `Arc`. Optional subsystems (rate limiting, request limits, TLS) are
/// `None` when disabled.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub listen_addr: SocketAddr,
    pub upstreams: Vec<ValidatedUpstream>,
    pub strategy: StrategyKind,
    pub health: HealthCheckConfig,
    pub breaker: BreakerConfig,
    pub metrics_enabled: bool,
    pub metrics_addr: SocketAddr,
    pub rate_limit: Option<RateLimitConfig>,
    pub request_limits: Option<RequestLimitConfig>,
    pub tls: Option<TlsConfig>,
}

impl Config {
    /// Collects configuration from `LB_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            listen_addr: env_str("LB_LISTEN_ADDR", &defaults.listen_addr),
            backends: parse_csv(&env_str("LB_BACKENDS", "")),
            weights: parse_weight_csv(&env_str("LB_WEIGHTS", "")),
            strategy: env_str("LB_STRATEGY", &defaults.strategy),
            health: HealthCheckConfig {
                interval: env_duration("LB_HEALTH_INTERVAL", DEFAULT_HEALTH_INTERVAL),
                timeout: env_duration("LB_HEALTH_TIMEOUT", DEFAULT_HEALTH_TIMEOUT),
                path: env_str("LB_HEALTH_PATH", DEFAULT_HEALTH_PATH),
            },
            breaker: BreakerConfig {
                max_failures: env_u32("LB_MAX_FAILURES", defaults.breaker.max_failures),
                open_timeout: env_duration("LB_OPEN_TIMEOUT", defaults.breaker.open_timeout),
            },
            metrics_enabled: env_bool("LB_METRICS_ENABLED", defaults.metrics_enabled),
            metrics_addr: env_str("LB_METRICS_ADDR", &defaults.metrics_addr),
            rate_limit_enabled: env_bool("LB_RATE_LIMIT_ENABLED", false),
            rate_limit: RateLimitConfig {
                max_requests: env_u32("LB_RATE_LIMIT_MAX", defaults.rate_limit.max_requests),
                window: env_duration("LB_RATE_LIMIT_WINDOW", defaults.rate_limit.window),
            },
            request_limit_enabled: env_bool("LB_REQUEST_LIMIT_ENABLED", false),
            limits: RequestLimitConfig {
                max_body_size: env_u64("LB_MAX_BODY_SIZE", DEFAULT_MAX_BODY_SIZE),
                max_header_size: env_u64("LB_MAX_HEADER_SIZE", DEFAULT_MAX_HEADER_SIZE as u64)
                    as usize,
            },
            tls_enabled: env_bool("LB_TLS_ENABLED", false),
            tls: TlsConfig {
                cert_path: env_str("LB_TLS_CERT_FILE", &defaults.tls.cert_path),
                key_path: env_str("LB_TLS_KEY_FILE", &defaults.tls.key_path),
                auto_generate: env_bool("LB_TLS_AUTO_GEN", true),
            },
        }
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// Fails if the upstream list is empty, any upstream URL is not an
    /// absolute `http`/`https` URI, the weight list length disagrees with
    /// the upstream list, or an address fails to parse. An unknown
    /// strategy name falls back to round-robin with a warning.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.backends.is_empty() {
            return Err(ProxyError::Config(
                "LB_BACKENDS cannot be empty (comma-separated list of upstream URLs)".into(),
            ));
        }

        if !self.weights.is_empty() && self.weights.len() != self.backends.len() {
            return Err(ProxyError::Config(format!(
                "got {} weights for {} upstreams",
                self.weights.len(),
                self.backends.len()
            )));
        }

        let mut upstreams = Vec::with_capacity(self.backends.len());
        for (i, raw) in self.backends.iter().enumerate() {
            let uri = raw
                .parse::<hyper::Uri>()
                .map_err(|e| ProxyError::InvalidUpstream(format!("{raw}: {e}")))?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                return Err(ProxyError::InvalidUpstream(format!(
                    "{raw}: upstream URL must be absolute (scheme and host)"
                )));
            }
            let weight = self.weights.get(i).copied().unwrap_or(1).max(1);
            upstreams.push(ValidatedUpstream { uri, weight });
        }

        let strategy = StrategyKind::parse(&self.strategy).unwrap_or_else(|| {
            warn!(
                strategy = %self.strategy,
                "unknown strategy, defaulting to round_robin"
            );
            StrategyKind::RoundRobin
        });

        Ok(RuntimeConfig {
            listen_addr: parse_listen_addr(&self.listen_addr)?,
            upstreams,
            strategy,
            health: self.health,
            breaker: self.breaker,
            metrics_enabled: self.metrics_enabled,
            metrics_addr: parse_listen_addr(&self.metrics_addr)?,
            rate_limit: self.rate_limit_enabled.then_some(self.rate_limit),
            request_limits: self.request_limit_enabled.then_some(self.limits),
            tls: self.tls_enabled.then_some(self.tls),
        })
    }
}

/// Parses a listen address, treating a bare `:port` as all interfaces.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_owned()
    };
    normalized
        .parse::<SocketAddr>()
        .map_err(|e| ProxyError::Config(format!("invalid listen address {raw}: {e}")))
}

/// Splits a comma-separated list, trimming whitespace and dropping empties.
pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses a comma-separated weight list; unparseable entries become 1.
pub fn parse_weight_csv(raw: &str) -> Vec<u32> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|part| part.trim().parse::<u32>().unwrap_or(1))
        .collect()
}

/// Parses a duration written as `250ms`, `2s`, `1m`, or a bare number of
/// seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = raw.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_owned(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}
