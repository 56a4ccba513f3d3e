//! Adaptive reverse proxy
//!
//! The public face of the bundle. Port 443 terminates TLS and, per request,
//! consults the monitor's readiness snapshot: when the system is ready and an
//! ingress endpoint is known the request is forwarded to it, otherwise the
//! static site-down page is served. Port 80 only redirects callers to HTTPS.
//!
//! The reserved `/ops/` prefix is always served from local static assets so
//! operator pages stay reachable while the cluster is down. Gateway-class
//! backend failures (502/503/504, connect errors) are masked with the
//! site-down page rather than leaked to browsers.

pub mod tls;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{debug, info, warn};

use crate::config::InstallLayout;
use crate::monitor::{Monitor, ReadinessSnapshot};
use crate::{Error, Result, HTTPS_PORT, HTTP_PORT, OPS_PREFIX};

/// File under the web root served whenever the system cannot take traffic
const SITE_DOWN_PAGE: &str = "site-down.html";

/// Largest request body the proxy will buffer before forwarding
const MAX_FORWARD_BODY: usize = 64 * 1024 * 1024;

/// Where a request should go, derived from one readiness snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to the ingress endpoint at this URL
    Forward(String),
    /// Serve the static site-down page
    SiteDown,
}

/// Decide the route for a request path from the given snapshot. Forwarding
/// requires both a known ingress endpoint and an overall ready system.
pub fn decide(snapshot: &ReadinessSnapshot, path_and_query: &str) -> RouteDecision {
    match snapshot.ingress_endpoint {
        Some(ip) if snapshot.system_ready => {
            RouteDecision::Forward(format!("http://{}{}", ip, path_and_query))
        }
        _ => RouteDecision::SiteDown,
    }
}

/// Backend statuses that mean "the cluster edge is there but the application
/// behind it is not"; masked with the site-down page
pub fn is_gateway_error(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Clone)]
struct ProxyState {
    monitor: Arc<Monitor>,
    web_root: PathBuf,
    client: reqwest::Client,
}

/// The TLS-terminating adaptive proxy and its plaintext redirect listener
pub struct AdaptiveProxy {
    state: ProxyState,
    bind_address: IpAddr,
    tls_cert: PathBuf,
    tls_key: PathBuf,
}

impl AdaptiveProxy {
    /// Create the proxy. The TLS key material must already exist (see
    /// [`tls::ensure_server_keys`]).
    pub fn new(monitor: Arc<Monitor>, layout: &InstallLayout, bind_address: IpAddr) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::proxy(e.to_string()))?;

        Ok(Self {
            state: ProxyState {
                monitor,
                web_root: layout.web_root(),
                client,
            },
            bind_address,
            tls_cert: layout.tls_cert(),
            tls_key: layout.tls_key(),
        })
    }

    /// Serve both listeners until the process shuts down. Failure to bind
    /// either port is fatal.
    pub async fn serve(self) -> Result<()> {
        let tls = RustlsConfig::from_pem_file(&self.tls_cert, &self.tls_key)
            .await
            .map_err(|e| Error::tls(format!("cannot load server key material: {}", e)))?;

        let https_addr = SocketAddr::new(self.bind_address, HTTPS_PORT);
        let http_addr = SocketAddr::new(self.bind_address, HTTP_PORT);
        info!(https = %https_addr, http = %http_addr, "proxy listening");

        let https = axum_server::bind_rustls(https_addr, tls)
            .serve(router(self.state).into_make_service());
        let http = axum_server::bind(http_addr).serve(redirect_router().into_make_service());

        tokio::try_join!(https, http)?;
        Ok(())
    }
}

/// The HTTPS router: reserved operator assets plus the adaptive fallback
fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/ops/{*asset}", any(serve_ops))
        .fallback(any(adaptive))
        .with_state(state)
}

/// The plaintext router: every request is upgraded to HTTPS
fn redirect_router() -> Router {
    Router::new().fallback(any(redirect_to_https))
}

async fn redirect_to_https(req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    // Strip an explicit port so the redirect lands on the default HTTPS port
    let host = strip_port(host);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Redirect::permanent(&format!("https://{}{}", host, path_and_query)).into_response()
}

/// Drop an explicit port from a Host header value. IPv6 literals keep
/// their brackets.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

async fn serve_ops(State(state): State<ProxyState>, uri: Uri) -> Response {
    serve_static(&state.web_root, uri.path()).await
}

async fn adaptive(State(state): State<ProxyState>, req: Request) -> Response {
    let snapshot = state.monitor.snapshot();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    match decide(&snapshot, &path_and_query) {
        RouteDecision::SiteDown => site_down(&state.web_root).await,
        RouteDecision::Forward(url) => forward(&state, url, req).await,
    }
}

async fn forward(state: &ProxyState, url: String, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_FORWARD_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "rejecting oversized or unreadable request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    // The ingress controller routes by Host, so the inbound value must
    // survive the hop instead of being replaced with the cluster IP
    let mut outbound = state
        .client
        .request(parts.method, &url)
        .headers(forwardable_headers(&parts.headers))
        .body(body);
    if let Some(host) = parts.headers.get(header::HOST) {
        outbound = outbound.header(header::HOST, host.clone());
    }
    let result = outbound.send().await;

    match result {
        Ok(backend) if is_gateway_error(backend.status()) => {
            debug!(status = %backend.status(), url = %url, "masking gateway error");
            site_down(&state.web_root).await
        }
        Ok(backend) => {
            let status = backend.status();
            let headers = forwardable_headers(backend.headers());
            let mut response = Response::new(Body::from_stream(backend.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            debug!(error = %e, url = %url, "backend unreachable, serving site-down page");
            site_down(&state.web_root).await
        }
    }
}

/// Copy headers, dropping the hop-by-hop set. Host is dropped here too; the
/// forward path re-adds the inbound value explicitly, and it is meaningless
/// on responses.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [header::HeaderName; 5] = [
        header::HOST,
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Serve the site-down page with 200 so browsers render it rather than an
/// error interstitial. A missing asset degrades to a plain 404.
async fn site_down(web_root: &Path) -> Response {
    match tokio::fs::read_to_string(web_root.join(SITE_DOWN_PAGE)).await {
        Ok(page) => (StatusCode::OK, Html(page)).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Site is unavailable").into_response(),
    }
}

/// Serve a static asset under the web root, 1:1 with the request path.
/// Traversal outside the web root is rejected.
async fn serve_static(web_root: &Path, request_path: &str) -> Response {
    debug_assert!(request_path.starts_with(OPS_PREFIX));
    let relative = request_path.trim_start_matches('/');
    if relative.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let asset = web_root.join(relative);
    match tokio::fs::read(&asset).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type_for(&asset))],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
