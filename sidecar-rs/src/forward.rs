//! Request forwarding
//!
//! Every request goes to the one configured backend. [`rewrite`] builds the
//! outbound request, [`map_error`] turns any failure into the downstream
//! gateway error, and [`Forwarder`] ties both to the upstream transport.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode, Uri};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::upstream::UpstreamTransport;

/// Body sent to the client whenever the backend cannot be reached
pub const BACKEND_ERROR_BODY: &str = "Error contacting backend service\n";

/// Headers that only describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to the backend over a shared transport
pub struct Forwarder {
    config: ProxyConfig,
    transport: UpstreamTransport,
}

impl Forwarder {
    /// Create a forwarder around an existing transport
    pub fn new(config: ProxyConfig, transport: UpstreamTransport) -> Self {
        Self { config, transport }
    }

    /// Relay one request and return the backend response, or the gateway
    /// error response if anything on the way fails.
    pub async fn forward(
        &self,
        req: Request<Body>,
        client: Option<SocketAddr>,
    ) -> Response<Body> {
        info!(
            method = %req.method(),
            path = %req.uri().path(),
            target = %self.config.target,
            authority = %self.config.authority,
            "Request received"
        );

        match self.try_forward(req, client.map(|addr| addr.ip())).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = ?e, "Error handling request: {}", e);
                map_error(&e)
            }
        }
    }

    async fn try_forward(
        &self,
        req: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<Body>> {
        let outbound = rewrite(req, &self.config, client_ip)?;
        debug!(
            method = %outbound.method(),
            uri = %outbound.uri(),
            target = %self.config.target,
            "Forwarding request"
        );

        let response = self.transport.send(outbound).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Build the outbound request for the backend.
///
/// Host and the URI authority (`:authority` on HTTP/2) are set to the
/// configured authority, the scheme is always `https`, and the path and query
/// are kept byte for byte (joined onto the target's base path, if it has one).
/// The result is a fresh request: version and extensions of the inbound
/// connection are not carried over.
pub fn rewrite(
    req: Request<Body>,
    config: &ProxyConfig,
    client_ip: Option<IpAddr>,
) -> Result<Request<Body>> {
    let (parts, body) = req.into_parts();

    let uri = outbound_uri(&parts.uri, config)?;
    let authority = HeaderValue::from_str(&config.authority).map_err(|e| {
        ProxyError::Http(format!("Invalid authority '{}': {}", config.authority, e))
    })?;

    let mut headers = parts.headers;
    let te_trailers = accepts_trailers(&headers);
    strip_hop_by_hop(&mut headers);
    if te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
    headers.insert(header::HOST, authority);

    if let Some(ip) = client_ip {
        append_forwarded_for(&mut headers, ip)?;
    }

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(uri)
        .body(body)
        .map_err(|e| ProxyError::Http(e.to_string()))?;
    *outbound.headers_mut() = headers;

    Ok(outbound)
}

/// Response sent downstream when the backend could not be used
pub fn map_error(_error: &ProxyError) -> Response<Body> {
    let mut response = Response::new(Body::from(BACKEND_ERROR_BODY));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

fn outbound_uri(inbound: &Uri, config: &ProxyConfig) -> Result<Uri> {
    let path = join_path(config.target.path(), inbound.path());
    let query = match (config.target.query(), inbound.query()) {
        (Some(base), Some(q)) if !base.is_empty() => Some(format!("{}&{}", base, q)),
        (Some(base), None) if !base.is_empty() => Some(base.to_string()),
        (_, q) => q.map(str::to_string),
    };

    let uri = match query {
        Some(q) => format!("https://{}{}?{}", config.authority, path, q),
        None => format!("https://{}{}", config.authority, path),
    };

    uri.parse()
        .map_err(|e| ProxyError::Http(format!("Invalid outbound URI '{}': {}", uri, e)))
}

/// Join a base path and a request path with exactly one slash between them
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// `te: trailers` is the one TE value that survives; gRPC depends on it
fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("trailers"))
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) -> Result<()> {
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    let value = HeaderValue::from_str(&value).map_err(|e| ProxyError::Http(e.to_string()))?;
    headers.insert("x-forwarded-for", value);
    Ok(())
}
