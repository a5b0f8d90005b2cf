//! HTTP header processing: hop-by-hop removal, forwarding header
//! injection, request ID minting, host rewriting, and request limit
//! predicates.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop header handling) and the de-facto `X-Forwarded-For` /
//! `X-Request-ID` conventions for reverse proxies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Global monotonic counter making minted request IDs unique within the
/// process even when two requests arrive in the same nanosecond.
static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// The connection-scoped headers named by RFC 7230 Section 6.1. These
/// describe a single hop and must never be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes all hop-by-hop headers from the given header map: the
/// standard RFC 7230 set plus any extra names the `Connection` header
/// itself declares as connection-scoped.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get(hyper::header::CONNECTION)
        .and_then(|val| val.to_str().ok())
        .into_iter()
        .flat_map(|val| val.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in declared {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Appends the client IP (port stripped) to `X-Forwarded-For`, preserving
/// any existing proxy chain as a comma-separated list.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();

    let xff_value = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or(client_ip);

    if let Ok(val) = HeaderValue::from_str(&xff_value) {
        headers.insert("x-forwarded-for", val);
    }
}

/// Ensures the request carries an `X-Request-ID`, minting
/// `lb-{unix-nanos}-{sequence}` when absent. Returns the effective ID.
pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(existing) = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
    {
        return existing.to_owned();
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let id = format!("lb-{nanos}-{seq}");

    if let Ok(val) = HeaderValue::from_str(&id) {
        headers.insert("x-request-id", val);
    }
    id
}

/// Points the `Host` header at the upstream authority, whatever the
/// client originally sent. An authority that does not form a valid
/// header value leaves the map untouched.
pub fn rewrite_host(headers: &mut HeaderMap, upstream_auth: &Authority) {
    let Ok(host) = HeaderValue::from_str(upstream_auth.as_str()) else {
        return;
    };
    headers.insert(hyper::header::HOST, host);
}

/// Flags requests carrying both `Content-Length` and `Transfer-Encoding`,
/// the ambiguity request smuggling exploits (RFC 7230 Section 3.3.3).
pub fn is_smuggling_attempt(headers: &HeaderMap) -> bool {
    let declares_length = headers.contains_key(hyper::header::CONTENT_LENGTH);
    let declares_encoding = headers.contains_key(hyper::header::TRANSFER_ENCODING);
    declares_length && declares_encoding
}

/// Returns `true` if the request declares a `Content-Length` above
/// `max_bytes`. A missing or unparseable declaration does not trip this
/// check; the byte cap on the actual body stream covers those.
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    match declared_content_length(headers) {
        Some(len) => len > max_bytes,
        None => false,
    }
}

/// The parsed `Content-Length` declaration, if present and well-formed.
fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(hyper::header::CONTENT_LENGTH)?.to_str().ok()?;
    raw.trim().parse().ok()
}

/// Returns `true` if the combined size of all header names and values
/// exceeds `max_bytes`.
pub fn header_size_exceeds(headers: &HeaderMap, max_bytes: usize) -> bool {
    let total: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    total > max_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .fold(HeaderMap::new(), |mut map, (name, value)| {
                map.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
                map
            })
    }

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut headers = header_map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("x-custom", "preserved"),
        ]);

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));

        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn strips_connection_declared_headers() {
        let mut headers = header_map(&[
            ("connection", "x-secret-internal, x-debug-token"),
            ("x-secret-internal", "leaked"),
            ("x-debug-token", "abc"),
            ("x-safe", "keep"),
        ]);

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("x-secret-internal"));
        assert!(!headers.contains_key("x-debug-token"));
        assert!(!headers.contains_key("connection"));

        assert!(headers.contains_key("x-safe"));
    }

    #[test]
    fn forwarded_for_strips_client_port() {
        let mut headers = HeaderMap::new();
        let addr = "192.168.1.10:5000".parse::<SocketAddr>().unwrap();

        append_forwarded_for(&mut headers, addr);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "192.168.1.10"
        );
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);
        let addr = "192.168.1.10:5000".parse::<SocketAddr>().unwrap();

        append_forwarded_for(&mut headers, addr);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "10.0.0.1, 192.168.1.10"
        );
    }

    #[test]
    fn mints_request_id_when_absent() {
        let mut headers = HeaderMap::new();

        let id = ensure_request_id(&mut headers);

        assert!(id.starts_with("lb-"));
        assert_eq!(headers.get("x-request-id").unwrap().to_str().unwrap(), id);
    }

    #[test]
    fn minted_request_ids_are_unique() {
        let mut first = HeaderMap::new();
        let mut second = HeaderMap::new();
        assert_ne!(ensure_request_id(&mut first), ensure_request_id(&mut second));
    }

    #[test]
    fn preserves_existing_request_id() {
        let mut headers = header_map(&[("x-request-id", "caller-supplied")]);

        let id = ensure_request_id(&mut headers);

        assert_eq!(id, "caller-supplied");
        assert_eq!(
            headers.get("x-request-id").unwrap().to_str().unwrap(),
            "caller-supplied"
        );
    }

    #[test]
    fn rewrites_host_to_upstream_authority() {
        let mut headers = header_map(&[("host", "client-facing.com")]);
        let authority = "backend.internal:3000".parse::<Authority>().unwrap();

        rewrite_host(&mut headers, &authority);

        assert_eq!(
            headers.get("host").unwrap().to_str().unwrap(),
            "backend.internal:3000"
        );
    }

    #[test]
    fn detects_smuggling_attempt() {
        let headers = header_map(&[("content-length", "42"), ("transfer-encoding", "chunked")]);
        assert!(is_smuggling_attempt(&headers));

        let only_length = header_map(&[("content-length", "42")]);
        assert!(!is_smuggling_attempt(&only_length));
    }

    #[test]
    fn content_length_limit_checks() {
        let headers = header_map(&[("content-length", "1024")]);
        assert!(!content_length_exceeds(&headers, 2048));
        assert!(content_length_exceeds(&headers, 512));

        let missing = HeaderMap::new();
        assert!(!content_length_exceeds(&missing, 1));

        let garbage = header_map(&[("content-length", "not-a-number")]);
        assert!(!content_length_exceeds(&garbage, 1));
    }

    #[test]
    fn header_size_counts_names_and_values() {
        let headers = header_map(&[("x-a", "1234")]);
        // "x-a" (3) + "1234" (4) = 7 bytes.
        assert!(!header_size_exceeds(&headers, 7));
        assert!(header_size_exceeds(&headers, 6));
    }
}
