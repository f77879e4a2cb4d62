//! Upstream transport
//!
//! A pooled HTTP client that always dials the configured backend over TLS and
//! negotiates HTTP/2 (falling back to HTTP/1.1) through ALPN. The request URI
//! only decides the `:authority`/Host sent to the backend, never the socket
//! that is opened.

use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Port dialled when the target URL does not write one
const DEFAULT_TLS_PORT: u16 = 443;

/// How long an idle backend connection stays in the pool
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

type HttpsClient = Client<TargetConnector, Body>;

/// Shared upstream transport. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct UpstreamTransport {
    client: HttpsClient,
}

impl UpstreamTransport {
    /// Build the transport for the configured target
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let tls = client_tls_config(config.insecure_skip_verify)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let connector = TargetConnector {
            inner: https,
            dial: dial_uri(&config.target_authority)?,
        };

        debug!(dial = %connector.dial, "Upstream transport ready");

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Ok(Self { client })
    }

    /// Send one request to the backend
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        Ok(self.client.request(req).await?)
    }
}

/// Connector that ignores the request URI and always opens a TLS connection
/// to the backend.
#[derive(Clone)]
pub struct TargetConnector {
    inner: HttpsConnector<HttpConnector>,
    dial: Uri,
}

impl tower::Service<Uri> for TargetConnector {
    type Response = <HttpsConnector<HttpConnector> as tower::Service<Uri>>::Response;
    type Error = <HttpsConnector<HttpConnector> as tower::Service<Uri>>::Error;
    type Future = <HttpsConnector<HttpConnector> as tower::Service<Uri>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        self.inner.call(self.dial.clone())
    }
}

/// `https://host:port` for the backend socket. The scheme is always `https`,
/// whatever the target URL says, and a written port is always kept.
pub fn dial_uri(target: &Authority) -> Result<Uri> {
    let port = target.port_u16().unwrap_or(DEFAULT_TLS_PORT);

    format!("https://{}:{}", target.host(), port)
        .parse()
        .map_err(|e| ProxyError::Config(format!("Invalid target address: {}", e)))
}

fn client_tls_config(insecure_skip_verify: bool) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;

    if insecure_skip_verify {
        warn!("Upstream certificate verification is disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::Tls(format!("Failed to load native root certificates: {}", e)))?;
    let (added, ignored) = roots.add_parsable_certificates(native);
    debug!(added, ignored, "Loaded native root certificates");

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Skips chain and hostname validation. Handshake signatures are still
/// checked so the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSettings;

    fn target(url: &str) -> Authority {
        ProxyConfig::resolve(EnvSettings {
            proxy_target: Some(url.to_string()),
            ..Default::default()
        })
        .unwrap()
        .target_authority
    }

    #[test]
    fn test_dial_uri_keeps_port() {
        let uri = dial_uri(&target("https://backend.internal:9443")).unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.authority().unwrap().as_str(), "backend.internal:9443");
    }

    #[test]
    fn test_dial_uri_defaults_to_443() {
        let uri = dial_uri(&target("https://backend.internal")).unwrap();
        assert_eq!(uri.port_u16(), Some(443));
    }

    #[test]
    fn test_dial_uri_forces_tls() {
        let uri = dial_uri(&target("http://backend.internal:8080/base")).unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.authority().unwrap().as_str(), "backend.internal:8080");
    }

    #[test]
    fn test_dial_uri_keeps_written_default_port() {
        let uri = dial_uri(&target("http://backend.internal:80")).unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.authority().unwrap().as_str(), "backend.internal:80");

        let uri = dial_uri(&target("https://backend.internal:443")).unwrap();
        assert_eq!(uri.authority().unwrap().as_str(), "backend.internal:443");
    }

    #[test]
    fn test_dial_uri_ipv6() {
        let uri = dial_uri(&target("https://[::1]:9443")).unwrap();
        assert_eq!(uri.host(), Some("[::1]"));
        assert_eq!(uri.port_u16(), Some(9443));
    }

    #[test]
    fn test_insecure_verifier_accepts_any_chain() {
        let verifier = AcceptAnyServerCert {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let name = ServerName::try_from("backend.internal").unwrap();

        let verified = verifier.verify_server_cert(
            &CertificateDer::from(vec![0u8; 8]),
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(verified.is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_transport_builds_insecure() {
        let config = ProxyConfig::resolve(EnvSettings {
            proxy_target: Some("https://backend.internal:9443".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(UpstreamTransport::new(&config).is_ok());
    }
}
