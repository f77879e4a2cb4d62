//! Server-side TLS
//!
//! Loads the sidecar's certificate chain and private key from PEM files and
//! advertises HTTP/2 and HTTP/1.1 through ALPN.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{ProxyError, Result};

/// ALPN protocols offered to clients, most preferred first
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// TLS manager for the server identity
pub struct TlsManager {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsManager {
    /// Create a new TLS manager
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Build a TLS acceptor from the configured files
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let server_config = self.build_server_config()?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    /// Build rustls server config
    pub fn build_server_config(&self) -> Result<ServerConfig> {
        info!(
            "Loading TLS certificate from {} and {}",
            self.cert_path.display(),
            self.key_path.display()
        );

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;

        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(config)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!(
            "Failed to open certificate file {}: {}",
            path.display(),
            e
        ))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Accepts PKCS#8, PKCS#1 (RSA) and SEC1 (EC) keys; the first one wins
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| {
            ProxyError::Tls(format!("No private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_identity(dir: &TempDir) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("sidecar.pem");
        let key_path = dir.path().join("sidecar.key");
        fs::write(&cert_path, cert.cert.pem()).unwrap();
        fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_identity() {
        let dir = TempDir::new().unwrap();
        let (cert_path, key_path) = write_identity(&dir);

        let config = TlsManager::new(cert_path, key_path)
            .build_server_config()
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_build_acceptor() {
        let dir = TempDir::new().unwrap();
        let (cert_path, key_path) = write_identity(&dir);

        assert!(TlsManager::new(cert_path, key_path).build_acceptor().is_ok());
    }

    #[test]
    fn test_missing_certificate() {
        let dir = TempDir::new().unwrap();
        let (_, key_path) = write_identity(&dir);

        let result = TlsManager::new(dir.path().join("missing.pem"), key_path).build_acceptor();
        assert!(matches!(result, Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_empty_certificate_file() {
        let dir = TempDir::new().unwrap();
        let (_, key_path) = write_identity(&dir);
        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();

        let err = TlsManager::new(empty, key_path).build_acceptor().err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = TempDir::new().unwrap();
        let (cert_path, _) = write_identity(&dir);

        // A certificate is not a key
        let err = TlsManager::new(cert_path.clone(), cert_path)
            .build_acceptor()
            .err()
            .unwrap();
        assert!(err.to_string().contains("No private key found"));
    }
}
