//! sidecar-rs: TLS-terminating sidecar proxy
//!
//! Terminates TLS for inbound HTTP/1.1 and HTTP/2 traffic and forwards every
//! request to one fixed backend, rewriting Host / `:authority` on the way.
//!
//! # Features
//!
//! - TLS termination with ALPN (`h2`, `http/1.1`)
//! - Single static backend, reached over pooled HTTP/2-over-TLS
//! - Host / `:authority` override for sidecar routing
//! - Uniform `502 Bad Gateway` when the backend cannot be reached
//!
//! # Environment
//!
//! ```text
//! PROXY_TARGET=https://backend.internal:9443   # required
//! PROXY_AUTHORITY=orders.svc.cluster.local     # default: target host[:port]
//! TLS_CERT_FILE=/opt/ssl/sidecar.pem
//! TLS_KEY_FILE=/opt/ssl/sidecar.key
//! PROXY_LISTEN_ADDR=0.0.0.0:8083
//! PROXY_INSECURE_SKIP_VERIFY=true
//! ```

pub mod config;
pub mod error;
pub mod forward;
pub mod server;
pub mod tls;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use forward::Forwarder;
pub use server::{start, ProxyServer};
pub use upstream::UpstreamTransport;
