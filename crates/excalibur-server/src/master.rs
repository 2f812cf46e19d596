//! Listeners the API server (the "master") dials through
//!
//! A master opens an HTTP/1.1 `CONNECT host:port` request. The server picks
//! an agent for `host`, opens a stream through it and, once the request is
//! upgraded, pipes bytes both ways.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::options::ProxyStrategy;
use crate::registry::AgentRegistry;
use crate::{Result, ServerError};

/// Time allowed for the agent to connect to the destination
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Mode of the master unix socket
const UDS_MODE: u32 = 0o660;

/// Routes master CONNECT requests through agents
pub struct MasterTunnel {
    registry: Arc<AgentRegistry>,
    strategy: ProxyStrategy,
}

impl MasterTunnel {
    /// Create a tunnel handler over `registry`
    pub fn new(registry: Arc<AgentRegistry>, strategy: ProxyStrategy) -> Self {
        Self { registry, strategy }
    }

    /// Handle one request from a master connection
    pub async fn handle(
        self: Arc<Self>,
        mut request: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        if request.method() != Method::CONNECT {
            return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, "only CONNECT is supported"));
        }
        let Some(authority) = request.uri().authority().cloned() else {
            return Ok(reply(StatusCode::BAD_REQUEST, "CONNECT target must be host:port"));
        };
        let target = authority.as_str().to_string();

        let Some(agent) = self.registry.select(authority.host(), self.strategy) else {
            warn!(target = %target, "No agent available");
            return Ok(reply(
                StatusCode::SERVICE_UNAVAILABLE,
                &ServerError::NoAgent(target).to_string(),
            ));
        };

        let mut stream = match agent.session.open(&target, DIAL_TIMEOUT).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, cluster = %agent.cluster_name, error = %e, "Dial through agent failed");
                return Ok(reply(StatusCode::BAD_GATEWAY, &e.to_string()));
            }
        };

        let upgrade = hyper::upgrade::on(&mut request);
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    let mut upgraded = TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut upgraded, &mut stream).await {
                        Ok((sent, received)) => {
                            debug!(target = %target, sent, received, "Master connection closed");
                        }
                        Err(e) => debug!(target = %target, error = %e, "Master connection error"),
                    }
                }
                Err(e) => warn!(target = %target, error = %e, "Master connection upgrade failed"),
            }
        });

        Ok(Response::new(Full::new(Bytes::new())))
    }
}

fn reply(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

async fn serve_connection<I>(io: I, tunnel: Arc<MasterTunnel>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| Arc::clone(&tunnel).handle(request));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!(error = %e, "Master connection ended with error");
    }
}

enum Kind {
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
    Plain(TcpListener),
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

/// A bound master listener
pub struct MasterListener {
    kind: Kind,
}

impl MasterListener {
    /// Human-readable address
    pub fn describe(&self) -> String {
        match &self.kind {
            Kind::Tls { listener, .. } => listener
                .local_addr()
                .map(|a| format!("https://{}", a))
                .unwrap_or_default(),
            Kind::Plain(listener) => listener
                .local_addr()
                .map(|a| format!("http://{}", a))
                .unwrap_or_default(),
            Kind::Unix { path, .. } => format!("unix://{}", path.display()),
        }
    }

    /// TCP address, for TCP listeners
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            Kind::Tls { listener, .. } | Kind::Plain(listener) => listener.local_addr().ok(),
            Kind::Unix { .. } => None,
        }
    }

    /// Accept masters until `stop` fires
    pub async fn run(self, tunnel: Arc<MasterTunnel>, stop: CancellationToken) {
        info!(addr = %self.describe(), "Accepting master connections");
        match self.kind {
            Kind::Tls { listener, acceptor } => loop {
                let stream = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept master connection");
                            continue;
                        }
                    },
                };
                let acceptor = acceptor.clone();
                let tunnel = Arc::clone(&tunnel);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => serve_connection(tls, tunnel).await,
                        Err(e) => debug!(error = %e, "Master TLS handshake failed"),
                    }
                });
            },
            Kind::Plain(listener) => loop {
                let stream = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept master connection");
                            continue;
                        }
                    },
                };
                tokio::spawn(serve_connection(stream, Arc::clone(&tunnel)));
            },
            Kind::Unix { listener, path } => {
                loop {
                    let stream = tokio::select! {
                        _ = stop.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(e) => {
                                warn!(error = %e, "Failed to accept master connection");
                                continue;
                            }
                        },
                    };
                    tokio::spawn(serve_connection(stream, Arc::clone(&tunnel)));
                }
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "Failed to remove master socket");
                }
            }
        }
        debug!("Master listener stopped");
    }
}

/// Binds master listeners
///
/// Socket setup is serialized through a lock owned by the factory, so two
/// listeners created by the same factory never race on the same path.
#[derive(Default)]
pub struct MasterListenerFactory {
    uds_lock: tokio::sync::Mutex<()>,
}

impl MasterListenerFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// mTLS listener on `addr`
    pub async fn bind_tls(
        &self,
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<MasterListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(MasterListener {
            kind: Kind::Tls {
                listener,
                acceptor: TlsAcceptor::from(tls),
            },
        })
    }

    /// Plain HTTP listener on `addr`
    pub async fn bind_insecure(&self, addr: SocketAddr) -> Result<MasterListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(MasterListener {
            kind: Kind::Plain(listener),
        })
    }

    /// Unix socket listener at `path`, replacing a stale socket file
    pub async fn bind_uds(&self, path: &Path) -> Result<MasterListener> {
        let _guard = self.uds_lock.lock().await;
        let bind_error = |source: std::io::Error| ServerError::Bind {
            addr: path.display().to_string(),
            source,
        };

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale master socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale master socket"),
        }

        let listener = UnixListener::bind(path).map_err(bind_error)?;
        set_socket_mode(path).map_err(bind_error)?;
        Ok(MasterListener {
            kind: Kind::Unix {
                listener,
                path: path.to_path_buf(),
            },
        })
    }
}

#[cfg(unix)]
fn set_socket_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(UDS_MODE))
}
