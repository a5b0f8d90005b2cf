//! TLS configuration for both inbound (termination) and outbound
//! (origination).
//!
//! Provides helpers to load PEM-encoded certificates and private keys
//! from disk, generate a self-signed certificate when configured to, and
//! construct [`rustls::ServerConfig`] and [`hyper_rustls::HttpsConnector`]
//! instances for the proxy's two TLS roles:
//!
//! - **Termination (client -> proxy):** Accepts HTTPS connections using a
//!   locally loaded certificate chain and private key.
//! - **Origination (proxy -> upstream):** Initiates HTTPS connections to
//!   upstreams using the Mozilla root certificate store.

use std::path::Path;
use std::sync::Arc;

use hyper_rustls::HttpsConnectorBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::{ProxyError, Result, TlsConfig};

/// Builds a [`TlsAcceptor`] from the given TLS configuration.
///
/// When `auto_generate` is set and either PEM file is missing, a
/// self-signed localhost certificate is generated and written to the
/// configured paths first. The resulting [`rustls::ServerConfig`] uses
/// safe defaults with no client authentication.
pub fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    if config.auto_generate
        && (!Path::new(&config.cert_path).exists() || !Path::new(&config.key_path).exists())
    {
        generate_self_signed(config)?;
    }

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("failed to build TLS server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Builds an HTTPS connector for outbound connections to upstreams.
///
/// Uses the Mozilla root certificate store via [`webpki_roots`] for
/// server verification. The connector supports both `http://` and
/// `https://` schemes; plain HTTP connections pass through unmodified.
pub fn build_https_connector()
-> hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let mut http = crate::forwarder::tuned_connector();
    http.enforce_http(false);

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http)
}

/// Generates a self-signed certificate for localhost and writes the PEM
/// pair to the configured paths.
fn generate_self_signed(config: &TlsConfig) -> Result<()> {
    let subject_alt_names = vec!["localhost".to_owned(), "127.0.0.1".to_owned()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| ProxyError::Tls(format!("failed to generate certificate: {e}")))?;

    std::fs::write(&config.cert_path, certified_key.cert.pem()).map_err(|e| {
        ProxyError::Tls(format!("failed to write {}: {e}", config.cert_path))
    })?;
    std::fs::write(&config.key_path, certified_key.signing_key.serialize_pem()).map_err(|e| {
        ProxyError::Tls(format!("failed to write {}: {e}", config.key_path))
    })?;

    info!(
        cert = %config.cert_path,
        key = %config.key_path,
        "generated self-signed certificate"
    );
    Ok(())
}

/// Reads every PEM-encoded X.509 certificate from the file at `path`.
///
/// Fails on an unreadable file, malformed PEM, or a file holding no
/// certificates at all.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("reading cert file {path}: {e}")))?;

    let mut remaining = pem.as_slice();
    let mut certs = Vec::new();
    for parsed in rustls_pemfile::certs(&mut remaining) {
        let cert =
            parsed.map_err(|e| ProxyError::Tls(format!("bad certificate in {path}: {e}")))?;
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

/// Reads the first usable private key from the PEM file at `path`,
/// accepting PKCS#8, PKCS#1 (RSA), and SEC1 (EC) encodings. Non-key PEM
/// blocks in the same file are skipped.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("reading key file {path}: {e}")))?;

    let mut remaining = pem.as_slice();
    while let Some(item) = rustls_pemfile::read_one(&mut remaining)
        .map_err(|e| ProxyError::Tls(format!("bad PEM block in {path}: {e}")))?
    {
        let key = match item {
            rustls_pemfile::Item::Pkcs8Key(key) => PrivateKeyDer::Pkcs8(key),
            rustls_pemfile::Item::Pkcs1Key(key) => PrivateKeyDer::Pkcs1(key),
            rustls_pemfile::Item::Sec1Key(key) => PrivateKeyDer::Sec1(key),
            _ => continue,
        };
        return Ok(key);
    }

    Err(ProxyError::Tls(format!("no private key found in {path}")))
}
