//! Tunnel client
//!
//! Holds one mTLS connection to the tunnel server, reconnecting with
//! backoff whenever it drops. Streams the server opens are dialled on the
//! local network and piped until either side closes.

use std::sync::Arc;
use std::time::Duration;

use excalibur_common::discovery::TunnelServerAddress;
use excalibur_common::retry::{retry_until_cancelled, RetryConfig};
use excalibur_common::KEEPALIVE_INTERVAL;
use excalibur_transport::handshake::{send_hello, Hello};
use excalibur_transport::{
    spawn_session, AgentIdentifiers, DialRequest, FrameCodec, Role, Session, SessionConfig,
};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AgentError, Result};

/// Time allowed to reach the tunnel server or a dial target
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials the tunnel server and serves its streams
pub struct TunnelClient {
    addr: TunnelServerAddress,
    connector: TlsConnector,
    hello: Hello,
    session: SessionConfig,
    retry: RetryConfig,
}

impl TunnelClient {
    /// Create a client for `addr` announcing `cluster_name` and `identifiers`
    pub fn new(
        addr: TunnelServerAddress,
        tls: Arc<rustls::ClientConfig>,
        cluster_name: &str,
        identifiers: &AgentIdentifiers,
    ) -> Self {
        Self {
            addr,
            connector: TlsConnector::from(tls),
            hello: Hello::new(cluster_name, identifiers),
            // The server pings every keepalive interval
            session: SessionConfig::passive(KEEPALIVE_INTERVAL * 3),
            retry: RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Override the reconnect backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the session keepalive behaviour
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Open one session: TCP, TLS, then hello
    pub async fn connect(&self, stop: &CancellationToken) -> Result<Session> {
        let target = self.addr.to_string();
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| AgentError::connect(&target, "connect timed out"))?
            .map_err(|e| AgentError::connect(&target, e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.addr.host.clone())
            .map_err(|e| AgentError::connect(&target, format!("invalid server name: {}", e)))?;
        let tls = tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| AgentError::connect(&target, "TLS handshake timed out"))?
            .map_err(|e| AgentError::connect(&target, format!("TLS handshake failed: {}", e)))?;

        let mut framed = Framed::new(tls, FrameCodec::new());
        send_hello(&mut framed, &self.hello).await?;
        Ok(spawn_session(framed, Role::Agent, self.session, stop.clone()))
    }

    /// Keep a session open until `stop` fires
    pub async fn run(self, stop: CancellationToken) {
        loop {
            let session = retry_until_cancelled(&self.retry, "connect to tunnel server", &stop, || {
                self.connect(&stop)
            })
            .await;
            let Some(session) = session else {
                break;
            };
            info!(
                server = %self.addr,
                cluster = %self.hello.cluster_name,
                "Connected to tunnel server"
            );
            serve(session, &stop).await;
            if stop.is_cancelled() {
                break;
            }
            warn!(server = %self.addr, "Tunnel connection lost, reconnecting");
        }
        debug!("Tunnel client stopped");
    }

    /// Spawn [`TunnelClient::run`]
    pub fn start(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}

async fn serve(session: Session, stop: &CancellationToken) {
    let Session {
        handle,
        mut dials,
        task,
    } = session;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                handle.close();
                break;
            }
            request = dials.recv() => match request {
                Some(request) => {
                    tokio::spawn(serve_dial(request));
                }
                None => break,
            },
        }
    }
    match task.await {
        Ok(Ok(())) => debug!("Tunnel session closed"),
        Ok(Err(e)) => warn!(error = %e, "Tunnel session failed"),
        Err(e) => warn!(error = %e, "Tunnel session task panicked"),
    }
}

async fn serve_dial(request: DialRequest) {
    let target = request.target().to_string();
    let upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "Dial failed");
            request.reject(&e.to_string()).await;
            return;
        }
        Err(_) => {
            debug!(target = %target, "Dial timed out");
            request.reject("dial timed out").await;
            return;
        }
    };

    let mut upstream = upstream;
    let mut stream = match request.accept().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target = %target, error = %e, "Session closed before dial was acknowledged");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((sent, received)) => debug!(target = %target, sent, received, "Stream closed"),
        Err(e) => debug!(target = %target, error = %e, "Stream failed"),
    }
}
