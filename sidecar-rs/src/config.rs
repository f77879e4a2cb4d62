//! Configuration for sidecar-rs
//!
//! Settings come from the process environment. [`EnvSettings`] is the raw
//! view as read by the `config` crate; [`ProxyConfig::resolve`] validates it
//! and fills in defaults.

use axum::http::uri::{Authority, Uri};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;
use url::Url;

use crate::error::{ProxyError, Result};

/// Default server certificate path
pub const DEFAULT_CERT_FILE: &str = "/opt/ssl/sidecar.pem";
/// Default server private key path
pub const DEFAULT_KEY_FILE: &str = "/opt/ssl/sidecar.key";
/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8083";

/// Raw settings as found in the environment.
///
/// Keys are the lowercased variable names (`PROXY_TARGET` -> `proxy_target`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvSettings {
    /// Backend base URL (`PROXY_TARGET`)
    pub proxy_target: Option<String>,
    /// Host / `:authority` override (`PROXY_AUTHORITY`)
    pub proxy_authority: Option<String>,
    /// Server certificate (`TLS_CERT_FILE`)
    pub tls_cert_file: Option<String>,
    /// Server private key (`TLS_KEY_FILE`)
    pub tls_key_file: Option<String>,
    /// Listen address (`PROXY_LISTEN_ADDR`)
    pub proxy_listen_addr: Option<String>,
    /// Skip upstream certificate verification (`PROXY_INSECURE_SKIP_VERIFY`)
    pub proxy_insecure_skip_verify: Option<bool>,
}

/// Resolved proxy configuration, read-only for the life of the process
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Backend base URL
    pub target: Url,
    /// Authority of the target exactly as written, explicit default port included
    pub target_authority: Authority,
    /// Value written to Host and `:authority` on every forwarded request
    pub authority: String,
    /// Path to the PEM certificate chain
    pub cert_file: PathBuf,
    /// Path to the PEM private key
    pub key_file: PathBuf,
    /// Socket address to listen on
    pub listen_addr: String,
    /// Accept any upstream certificate. Defaults to `true`.
    pub insecure_skip_verify: bool,
}

impl ProxyConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().ignore_empty(true))
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to read environment: {}", e)))?;

        let env: EnvSettings = settings
            .try_deserialize()
            .map_err(|e| ProxyError::Config(format!("Failed to parse environment: {}", e)))?;

        Self::resolve(env)
    }

    /// Validate raw settings and apply defaults
    pub fn resolve(env: EnvSettings) -> Result<Self> {
        let target = non_empty(env.proxy_target).ok_or_else(|| {
            ProxyError::Config("Environment variable PROXY_TARGET is required but not set".to_string())
        })?;

        let raw = target.trim();
        let target = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid target URL '{}': {}", raw, e)))?;

        if target.host_str().is_none() {
            return Err(ProxyError::Config(format!(
                "Target URL '{}' has no host",
                target
            )));
        }

        // `Url` forgets a port equal to the scheme default; keep it as written
        let target_authority = raw
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().cloned())
            .ok_or_else(|| {
                ProxyError::Config(format!("Target URL '{}' has no usable authority", raw))
            })?;

        let authority = match non_empty(env.proxy_authority) {
            Some(authority) => authority,
            None => {
                let authority = default_authority(&target_authority);
                info!(%authority, "PROXY_AUTHORITY not set, defaulting to target authority");
                authority
            }
        };

        authority.parse::<Authority>().map_err(|e| {
            ProxyError::Config(format!("Invalid authority '{}': {}", authority, e))
        })?;

        let cert_file = non_empty(env.tls_cert_file).unwrap_or_else(|| {
            info!("TLS_CERT_FILE not set, defaulting to {}", DEFAULT_CERT_FILE);
            DEFAULT_CERT_FILE.to_string()
        });

        let key_file = non_empty(env.tls_key_file).unwrap_or_else(|| {
            info!("TLS_KEY_FILE not set, defaulting to {}", DEFAULT_KEY_FILE);
            DEFAULT_KEY_FILE.to_string()
        });

        Ok(Self {
            target,
            target_authority,
            authority,
            cert_file: PathBuf::from(cert_file),
            key_file: PathBuf::from(key_file),
            listen_addr: non_empty(env.proxy_listen_addr)
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            insecure_skip_verify: env.proxy_insecure_skip_verify.unwrap_or(true),
        })
    }
}

/// `host[:port]` of the target, with the port only when one was written
pub fn default_authority(target: &Authority) -> String {
    match target.port_u16() {
        Some(port) => format!("{}:{}", target.host(), port),
        None => target.host().to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
