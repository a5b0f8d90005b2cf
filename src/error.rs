//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use hyper::{Response, StatusCode};

use crate::forwarder::{BoxBody, full};

/// Every failure the proxy can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration could not be loaded or is invalid.
    Config(String),
    /// An upstream URL is malformed or unparseable.
    InvalidUpstream(String),
    /// No upstream passed the eligibility gate.
    NoBackendAvailable,
    /// The selected upstream failed its dispatch-eligibility re-check.
    BackendUnavailable,
    /// The upstream was unreachable or the forwarded request failed.
    Upstream(String),
    /// The upstream did not produce response headers within the deadline.
    Timeout(Duration),
    /// The client exceeded its per-IP rate limit.
    RateLimited {
        /// Suggested wait before retrying, in milliseconds.
        retry_after_ms: u64,
    },
    /// The declared request body exceeds the configured limit.
    BodyTooLarge { limit: u64 },
    /// The request headers exceed the configured size limit.
    HeadersTooLarge { limit: usize },
    /// The request carried both `Content-Length` and `Transfer-Encoding`.
    RequestSmuggling,
    /// TLS setup failed (certificate loading, key parsing, generation).
    Tls(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::NoBackendAvailable => write!(f, "No backend available"),
            Self::BackendUnavailable => write!(f, "Backend temporarily unavailable"),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Timeout(d) => write!(f, "upstream timed out after {d:?}"),
            Self::RateLimited { retry_after_ms } => {
                write!(f, "rate limit exceeded, retry after {retry_after_ms}ms")
            }
            Self::BodyTooLarge { limit } => {
                write!(f, "request body exceeds limit of {limit} bytes")
            }
            Self::HeadersTooLarge { limit } => {
                write!(f, "request headers exceed limit of {limit} bytes")
            }
            Self::RequestSmuggling => {
                write!(f, "request carries both Content-Length and Transfer-Encoding")
            }
            Self::Tls(msg) => write!(f, "tls error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidUpstream(_) | Self::Tls(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoBackendAvailable | Self::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) | Self::Timeout(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::HeadersTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::RequestSmuggling => StatusCode::BAD_REQUEST,
        }
    }

    /// The machine-readable error tag used in JSON response bodies.
    fn tag(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidUpstream(_) => "invalid_upstream",
            Self::NoBackendAvailable => "no_backend_available",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout(_) => "upstream_timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::HeadersTooLarge { .. } => "headers_too_large",
            Self::RequestSmuggling => "request_smuggling",
            Self::Tls(_) => "tls_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.tag(),
            "message": self.to_string(),
        });

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");

        if let Self::RateLimited { retry_after_ms } = &self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            builder = builder.header("retry-after", secs);
        }

        builder.body(full(body.to_string())).unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full("internal error"))
                .expect("building fallback response must not fail")
        })
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
