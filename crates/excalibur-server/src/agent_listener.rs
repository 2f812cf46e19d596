//! Listener agents dial into
//!
//! Every connection must present a client certificate chaining to the
//! cluster CA. After the TLS handshake the agent sends its hello, and the
//! connection becomes a multiplexed session the master listeners dial
//! through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use excalibur_common::{KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT};
use excalibur_transport::handshake::read_hello;
use excalibur_transport::{spawn_session, FrameCodec, Role, SessionConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::AgentRegistry;
use crate::{Result, ServerError};

/// Time allowed for the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed between the handshake and the agent's hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts agent connections
pub struct AgentListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<AgentRegistry>,
    session: SessionConfig,
}

impl AgentListener {
    /// Bind `addr`; agents must authenticate with a certificate
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        registry: Arc<AgentRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            registry,
            session: SessionConfig::pinging(KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT),
        })
    }

    /// Override the keepalive behaviour of accepted sessions
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("listener address: {}", e)))
    }

    /// Accept agents until `stop` fires
    pub async fn run(self, stop: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Accepting agent connections");
        }
        loop {
            let (stream, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept agent connection");
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let registry = Arc::clone(&self.registry);
            let session = self.session;
            let stop = stop.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_agent(acceptor, stream, registry, session, stop).await {
                    warn!(peer = %peer, error = %e, "Agent connection ended with error");
                }
            });
        }
        debug!("Agent listener stopped");
    }
}

async fn serve_agent(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    registry: Arc<AgentRegistry>,
    config: SessionConfig,
    stop: CancellationToken,
) -> Result<()> {
    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| ServerError::Internal("TLS handshake timed out".to_string()))?
        .map_err(|e| ServerError::Internal(format!("TLS handshake failed: {}", e)))?;

    let mut framed = Framed::new(tls, FrameCodec::new());
    let hello = read_hello(&mut framed, HELLO_TIMEOUT).await?;
    let identifiers = hello.agent_identifiers()?;

    let session = spawn_session(framed, Role::Hub, config, stop);
    // Agents never dial the hub
    drop(session.dials);
    let entry = registry.register(hello.cluster_name, identifiers, session.handle);

    let result = session.task.await;
    registry.unregister(&entry);
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(ServerError::Internal(format!("session task failed: {}", e))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use excalibur_pki::credential::testing::TestCa;
    use excalibur_pki::credential::MockCredentialSource;
    use excalibur_pki::tls::{root_store_from_pem, ClientAuth, TransportSecurity};
    use excalibur_pki::{Credential, IdentityTemplate};
    use excalibur_common::discovery::ServerSans;
    use excalibur_transport::handshake::send_hello;
    use excalibur_transport::{AgentIdentifiers, Hello};
    use rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    /// Server and agent TLS material issued by one throwaway CA
    pub(crate) struct TestPki {
        pub ca: TestCa,
        pub server: TransportSecurity,
        pub agent: TransportSecurity,
    }

    fn fixed(cred: Credential) -> Arc<MockCredentialSource> {
        let cred = Arc::new(cred);
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(move || Some(cred.clone()));
        Arc::new(source)
    }

    pub(crate) fn test_pki() -> TestPki {
        let ca = TestCa::new("test-cluster-ca");
        let mut sans = ServerSans::default();
        sans.push_host("localhost");
        sans.push_ip("127.0.0.1".parse().expect("ip"));
        let server_cred = ca.issue(&IdentityTemplate::server(&sans, &[], &[]), Duration::from_secs(3600));
        let agent_cred = ca.issue(
            &IdentityTemplate::agent("cluster-a", "10.0.0.9".parse().expect("ip")),
            Duration::from_secs(3600),
        );
        let roots = || root_store_from_pem(ca.cert_pem()).expect("roots");
        TestPki {
            server: TransportSecurity::new(roots(), fixed(server_cred)),
            agent: TransportSecurity::new(roots(), fixed(agent_cred)),
            ca,
        }
    }

    async fn start(pki: &TestPki) -> (SocketAddr, Arc<AgentRegistry>, CancellationToken) {
        let registry = Arc::new(AgentRegistry::new());
        let tls = Arc::new(pki.server.server_config(ClientAuth::Require).expect("server tls"));
        let listener = AgentListener::bind("127.0.0.1:0".parse().expect("addr"), tls, registry.clone())
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stop = CancellationToken::new();
        tokio::spawn(listener.run(stop.clone()));
        (addr, registry, stop)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn story_agent_with_certificate_registers_and_unregisters() {
        let pki = test_pki();
        let (addr, registry, stop) = start(&pki).await;

        let connector = TlsConnector::from(Arc::new(pki.agent.client_config().expect("client tls")));
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let tls = connector
            .connect(ServerName::try_from("localhost").expect("name"), tcp)
            .await
            .expect("handshake");
        let mut framed = Framed::new(tls, FrameCodec::new());
        let ids = AgentIdentifiers::parse("host=cluster-a").expect("ids");
        send_hello(&mut framed, &Hello::new("cluster-a", &ids))
            .await
            .expect("hello");

        wait_for(|| registry.get("cluster-a").is_some()).await;
        drop(framed);
        wait_for(|| registry.is_empty()).await;
        stop.cancel();
    }

    #[tokio::test]
    async fn test_agent_without_certificate_is_refused() {
        let pki = test_pki();
        let (addr, registry, stop) = start(&pki).await;

        let roots = root_store_from_pem(pki.ca.cert_pem()).expect("roots");
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let result = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("localhost").expect("name"), tcp)
            .await;

        // TLS 1.3 reports the rejection on first use rather than at connect
        if let Ok(tls) = result {
            let mut framed = Framed::new(tls, FrameCodec::new());
            let ids = AgentIdentifiers::default();
            let _ = send_hello(&mut framed, &Hello::new("cluster-x", &ids)).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(registry.is_empty());
        stop.cancel();
    }

    #[tokio::test]
    async fn test_invalid_identifiers_are_not_registered() {
        let pki = test_pki();
        let (addr, registry, stop) = start(&pki).await;

        let connector = TlsConnector::from(Arc::new(pki.agent.client_config().expect("client tls")));
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let tls = connector
            .connect(ServerName::try_from("localhost").expect("name"), tcp)
            .await
            .expect("handshake");
        let mut framed = Framed::new(tls, FrameCodec::new());
        let hello = Hello {
            cluster_name: "cluster-a".to_string(),
            identifiers: "bogus=1".to_string(),
        };
        send_hello(&mut framed, &hello).await.expect("hello");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty());
        stop.cancel();
    }
}
