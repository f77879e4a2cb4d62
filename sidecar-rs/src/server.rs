//! TLS listener
//!
//! Accepts TCP connections, terminates TLS and serves HTTP/1.1 or HTTP/2
//! (whichever ALPN settled on) through an axum router whose only handler is
//! the [`Forwarder`].

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::tls::TlsManager;
use crate::upstream::UpstreamTransport;

/// Pause after a failed accept so a full file table does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Sidecar proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    forwarder: Arc<Forwarder>,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Load the server identity and build the upstream transport
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let tls_acceptor =
            TlsManager::new(&config.cert_file, &config.key_file).build_acceptor()?;

        let transport = UpstreamTransport::new(&config)?;
        let forwarder = Arc::new(Forwarder::new(config.clone(), transport));

        Ok(Self {
            config,
            forwarder,
            tls_acceptor,
        })
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.forwarder.clone())
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.config.listen_addr;
        TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {}: {}", addr, e),
            ))
        })
    }

    /// Bind, then serve until the process exits
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;

        info!(
            address = %local_addr,
            target = %self.config.target,
            authority = %self.config.authority,
            cert_file = %self.config.cert_file.display(),
            "Starting proxy server"
        );

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let router = self.router();

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let acceptor = self.tls_acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", addr, e);
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |mut req: Request<Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(addr));
                    router.clone().oneshot(req)
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Load configuration-backed resources, bind and serve.
///
/// Errors are returned rather than terminating the process; the caller
/// decides what a failed start means.
pub async fn start(config: ProxyConfig) -> Result<()> {
    info!("Proxy Target: {}", config.target);
    info!("Proxy Authority: {}", config.authority);
    info!("TLS Cert File: {}", config.cert_file.display());
    info!("TLS Key File: {}", config.key_file.display());

    ProxyServer::new(config)?.run().await
}

async fn proxy_handler(
    State(forwarder): State<Arc<Forwarder>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response<Body> {
    forwarder
        .forward(req, connect_info.map(|ConnectInfo(addr)| addr))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSettings;
    use axum::http::StatusCode;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, target: &str) -> ProxyConfig {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("sidecar.pem");
        let key_path = dir.path().join("sidecar.key");
        fs::write(&cert_path, cert.cert.pem()).unwrap();
        fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

        ProxyConfig::resolve(EnvSettings {
            proxy_target: Some(target.to_string()),
            tls_cert_file: Some(cert_path.display().to_string()),
            tls_key_file: Some(key_path.display().to_string()),
            proxy_listen_addr: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_proxy_server_creation() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir, "https://backend.internal:9443"));
        assert!(server.is_ok());
    }

    #[test]
    fn test_missing_identity_fails_startup() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, "https://backend.internal:9443");
        config.cert_file = dir.path().join("absent.pem");

        assert!(matches!(ProxyServer::new(config), Err(ProxyError::Tls(_))));
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let dir = TempDir::new().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = test_config(&dir, "https://backend.internal:9443");
        config.listen_addr = taken.local_addr().unwrap().to_string();

        let server = ProxyServer::new(config).unwrap();
        assert!(matches!(server.bind().await, Err(ProxyError::Io(_))));
    }

    #[tokio::test]
    async fn test_router_maps_backend_failure() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir, "https://127.0.0.1:1")).unwrap();

        let req = Request::builder()
            .uri("/v1/items?x=1")
            .body(Body::empty())
            .unwrap();
        let response = server.router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
