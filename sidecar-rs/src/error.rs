//! Error types for sidecar-rs

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Request could not be rebuilt for the backend
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend connection or exchange failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}
