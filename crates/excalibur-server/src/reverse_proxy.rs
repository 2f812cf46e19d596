//! Path-based reverse proxy
//!
//! Routes, first match wins:
//! - `/v1/healthz` answers locally
//! - `/norm/api` and everything below it goes to the norm upstream
//! - everything else goes to the cluster API server
//!
//! Client certificates are requested but not required.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Result, ServerError};

/// Largest request body forwarded upstream
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Health endpoint path
pub const HEALTHZ_PATH: &str = "/v1/healthz";

/// Prefix served by the norm upstream
pub const NORM_PREFIX: &str = "/norm/api";

/// Time in-flight requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Headers meaningful only for a single transport hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where a request is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered locally
    Healthz,
    /// Forwarded to the norm upstream
    Norm,
    /// Forwarded to the cluster API server
    ApiServer,
}

/// Pick the route for `path`
pub fn route(path: &str) -> Route {
    if path == HEALTHZ_PATH {
        return Route::Healthz;
    }
    match path.strip_prefix(NORM_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => Route::Norm,
        _ => Route::ApiServer,
    }
}

/// Upstreams and the client used to reach them
pub struct ProxyState {
    client: reqwest::Client,
    apiserver: Option<String>,
    norm: String,
}

impl ProxyState {
    /// Build the proxy state; `apiserver` is `None` outside a cluster
    pub fn new(apiserver: Option<String>, norm: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            apiserver,
            norm: norm.into(),
        })
    }
}

/// Client for upstream requests
///
/// The API server is reached by service IP, so its certificate is not
/// verified.
fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ServerError::Internal(format!("failed to build proxy client: {}", e)))
}

/// Router dispatching every request through [`route`]
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    match route(request.uri().path()) {
        Route::Healthz => healthz(request.method()),
        Route::Norm => {
            let upstream = state.norm.clone();
            forward(&state, &upstream, request)
                .await
                .unwrap_or_else(IntoResponse::into_response)
        }
        Route::ApiServer => match state.apiserver.clone() {
            Some(upstream) => forward(&state, &upstream, request)
                .await
                .unwrap_or_else(IntoResponse::into_response),
            None => ServerError::Proxy("cluster API server address is unknown".into())
                .into_response(),
        },
    }
}

fn healthz(method: &Method) -> Response {
    if method == Method::GET {
        (StatusCode::OK, "OK").into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn forward(state: &ProxyState, upstream: &str, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream.trim_end_matches('/'), path);

    debug!(method = %parts.method, url = %url, "Forwarding request");

    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| ServerError::Proxy(format!("failed to read request body: {}", e)))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);

    let upstream_response = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Bound reverse proxy, ready to serve
pub struct ReverseProxy {
    listener: std::net::TcpListener,
    tls: Arc<rustls::ServerConfig>,
    state: Arc<ProxyState>,
}

impl ReverseProxy {
    /// Bind `addr` now so a taken port fails startup
    pub fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        state: Arc<ProxyState>,
    ) -> Result<Self> {
        let listener =
            std::net::TcpListener::bind(addr).map_err(|e| ServerError::bind(addr, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self {
            listener,
            tls,
            state,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("listener address: {}", e)))
    }

    /// Serve until `stop` fires
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let mut tls = (*self.tls).clone();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = RustlsConfig::from_config(Arc::new(tls));

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        info!(addr = %addr, "Starting reverse proxy");
        axum_server::from_tcp_rustls(self.listener, config)
            .handle(handle)
            .serve(router(self.state).into_make_service())
            .await
            .map_err(|e| ServerError::Internal(format!("reverse proxy failed: {}", e)))
    }
}
