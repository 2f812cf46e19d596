//! Server startup orchestration
//!
//! [`run_server`] wires the hub together: hooks, the certificate manager,
//! the signing request approver and, once a certificate is signed, the
//! agent listener, master listeners and reverse proxy. Any failure before
//! the listeners are up aborts startup.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use excalibur_common::discovery::{get_tunnel_server_sans, ServerSans};
use excalibur_common::env::{api_server_endpoint, server_namespace, OsEnvConfig};
use excalibur_common::hooks::{build_hooks, HookProviderKind, TunnelHooks};
use excalibur_common::kube_client::create_client;
use excalibur_common::retry::poll_until_ready;
use excalibur_common::CERT_POLL_INTERVAL;
use excalibur_pki::approver::{wait_for_cache_sync, CsrApprover};
use excalibur_pki::authority::{KubeSigningAuthority, SigningAuthority};
use excalibur_pki::template::{CertificateRole, TemplateFn};
use excalibur_pki::tls::{load_root_store, ClientAuth, TransportSecurity};
use excalibur_pki::{
    wait_for_current, CertificateManager, CertificateManagerConfig, CredentialSource,
    CredentialStore, IdentityTemplate,
};
use kube::Client;
use rustls::RootCertStore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::agent_listener::AgentListener;
use crate::master::{MasterListenerFactory, MasterTunnel};
use crate::options::ServerOptions;
use crate::registry::AgentRegistry;
use crate::reverse_proxy::{ProxyState, ReverseProxy};
use crate::{Result, ServerError};

/// File name prefix of the persisted server credential
const CREDENTIAL_PREFIX: &str = "tunnel";

/// Listeners of a started server
pub struct RunningServer {
    /// Address agents connect to
    pub agent_addr: SocketAddr,
    /// Master listeners, described as URLs
    pub master_listeners: Vec<String>,
    /// Address of the reverse proxy
    pub proxy_addr: SocketAddr,
    tasks: JoinSet<Result<()>>,
}

impl RunningServer {
    /// Wait for every listener to stop, returning the first failure
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ServerError::Internal(format!("listener task panicked: {}", e)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!(error = %e, "Listener failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Listener half of the hub, started once a certificate exists
pub struct TunnelServer {
    options: ServerOptions,
    hooks: Arc<dyn TunnelHooks>,
    credentials: Arc<dyn CredentialSource>,
    roots: RootCertStore,
    apiserver: Option<String>,
    registry: Arc<AgentRegistry>,
}

impl TunnelServer {
    /// Create a server presenting the certificates of `credentials`
    pub fn new(
        options: ServerOptions,
        hooks: Arc<dyn TunnelHooks>,
        credentials: Arc<dyn CredentialSource>,
        roots: RootCertStore,
        apiserver: Option<String>,
    ) -> Self {
        Self {
            options,
            hooks,
            credentials,
            roots,
            apiserver,
            registry: Arc::new(AgentRegistry::new()),
        }
    }

    /// Connected agents
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Wait for a certificate, then bind and start every listener
    ///
    /// Returns `Ok(None)` if `stop` fires before a certificate is available.
    /// Nothing is bound and the post-start hook does not run until then.
    pub async fn start(&self, stop: &CancellationToken) -> Result<Option<RunningServer>> {
        let Some(cred) = wait_for_current(self.credentials.as_ref(), CERT_POLL_INTERVAL, stop).await
        else {
            return Ok(None);
        };
        info!(
            common_name = %cred.common_name(),
            not_after = %cred.not_after(),
            "Server certificate available"
        );

        let security = TransportSecurity::new(self.roots.clone(), Arc::clone(&self.credentials));
        let mutual_tls = Arc::new(security.server_config(ClientAuth::Require)?);
        let proxy_tls = Arc::new(security.server_config(ClientAuth::Request)?);

        let agents = AgentListener::bind(
            self.options.agent_addr()?,
            Arc::clone(&mutual_tls),
            Arc::clone(&self.registry),
        )
        .await?;
        let agent_addr = agents.local_addr()?;

        let factory = MasterListenerFactory::new();
        let masters = match &self.options.uds_name {
            Some(path) => vec![factory.bind_uds(path).await?],
            None => vec![
                factory
                    .bind_tls(self.options.master_addr()?, Arc::clone(&mutual_tls))
                    .await?,
                factory
                    .bind_insecure(self.options.master_insecure_addr()?)
                    .await?,
            ],
        };
        let master_listeners = masters.iter().map(|m| m.describe()).collect();

        let state = Arc::new(ProxyState::new(
            self.apiserver.clone(),
            self.options.norm_upstream.clone(),
        )?);
        let proxy = ReverseProxy::bind(self.options.proxy_addr()?, proxy_tls, state)?;
        let proxy_addr = proxy.local_addr()?;

        let mut tasks = JoinSet::new();
        let listener_stop = stop.clone();
        tasks.spawn(async move {
            agents.run(listener_stop).await;
            Ok(())
        });
        let tunnel = Arc::new(MasterTunnel::new(
            Arc::clone(&self.registry),
            self.options.proxy_strategy,
        ));
        for master in masters {
            let tunnel = Arc::clone(&tunnel);
            let listener_stop = stop.clone();
            tasks.spawn(async move {
                master.run(tunnel, listener_stop).await;
                Ok(())
            });
        }
        tasks.spawn(proxy.run(stop.clone()));

        self.hooks.post_start_server().await?;
        info!(
            agent = %agent_addr,
            proxy = %proxy_addr,
            "Tunnel server started"
        );

        Ok(Some(RunningServer {
            agent_addr,
            master_listeners,
            proxy_addr,
            tasks,
        }))
    }
}

/// What server startup needs from the hub cluster
#[async_trait]
pub trait ServerCluster: Send + Sync {
    /// Hooks of the configured provider
    fn hooks(&self) -> Arc<dyn TunnelHooks>;

    /// Names the server certificate must carry
    async fn server_sans(&self) -> excalibur_common::Result<ServerSans>;

    /// Authority that signs the server certificate
    fn signing_authority(&self) -> Arc<dyn SigningAuthority>;

    /// Start approving tunnel signing requests through `authority`
    ///
    /// Resolves once the approver's cache has synced, or with `None` if
    /// `stop` fires first.
    async fn start_approver(
        &self,
        authority: Arc<dyn SigningAuthority>,
        workers: usize,
        stop: CancellationToken,
    ) -> Option<JoinHandle<()>>;
}

/// [`ServerCluster`] backed by the hub's API server
pub struct KubeServerCluster {
    client: Client,
    hooks: Arc<dyn TunnelHooks>,
    namespace: String,
}

impl KubeServerCluster {
    /// Use `client` for discovery, signing and approval
    pub fn new(client: Client, hook_provider: HookProviderKind, namespace: String) -> Self {
        let hooks = build_hooks(hook_provider, client.clone());
        info!(provider = hooks.provider_name(), %namespace, "Using hub cluster");
        Self {
            client,
            hooks,
            namespace,
        }
    }
}

#[async_trait]
impl ServerCluster for KubeServerCluster {
    fn hooks(&self) -> Arc<dyn TunnelHooks> {
        Arc::clone(&self.hooks)
    }

    async fn server_sans(&self) -> excalibur_common::Result<ServerSans> {
        get_tunnel_server_sans(&self.client, &self.namespace).await
    }

    fn signing_authority(&self) -> Arc<dyn SigningAuthority> {
        Arc::new(KubeSigningAuthority::new(self.client.clone()))
    }

    async fn start_approver(
        &self,
        authority: Arc<dyn SigningAuthority>,
        workers: usize,
        stop: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let approver = CsrApprover::new(self.client.clone(), authority, workers);
        let cache = approver.store();
        let task = tokio::spawn(approver.run(stop.clone()));
        if !wait_for_cache_sync(&cache, &stop).await {
            let _ = task.await;
            return None;
        }
        Some(task)
    }
}

/// Run the tunnel server until `stop` fires
pub async fn run_server(options: ServerOptions, stop: CancellationToken) -> Result<()> {
    options.validate()?;

    let env = OsEnvConfig;
    let client = create_client(options.kube_config.as_deref()).await?;
    let cluster = KubeServerCluster::new(client, options.hook_provider, server_namespace(&env));
    run_server_with(options, &cluster, api_server_endpoint(&env), stop).await
}

/// Start the server against `cluster`
///
/// Phases run in order: pre-start hook, SAN discovery, certificate manager,
/// approver with cache sync, then the listeners once a certificate exists.
pub async fn run_server_with(
    options: ServerOptions,
    cluster: &dyn ServerCluster,
    apiserver: Option<String>,
    stop: CancellationToken,
) -> Result<()> {
    let hooks = cluster.hooks();
    info!("Running pre-start hook");
    hooks.pre_start_server().await?;

    let sans = poll_until_ready("tunnel server service", CERT_POLL_INTERVAL, &stop, || async move {
        cluster.server_sans().await.map(Some)
    })
    .await;
    let Some(sans) = sans else {
        return Ok(());
    };

    let extra_dns = options.cert_dns_names.clone();
    let extra_ips = options.cert_ips.clone();
    let template: TemplateFn =
        Arc::new(move || Ok(IdentityTemplate::server(&sans, &extra_dns, &extra_ips)));
    let store = Arc::new(CredentialStore::open(options.pki_dir(), CREDENTIAL_PREFIX)?);
    let authority = cluster.signing_authority();
    let manager = Arc::new(CertificateManager::new(
        Arc::clone(&authority),
        store,
        template,
        CertificateManagerConfig {
            signer_name: options.signer_name.clone(),
            ..Default::default()
        },
    ));
    let manager_task = manager.start(stop.clone());
    info!(
        component = CertificateRole::Server.component(),
        "Certificate manager started"
    );

    let Some(approver_task) = cluster
        .start_approver(authority, options.approver_workers, stop.clone())
        .await
    else {
        info!("Stopped before the signing request cache synced");
        return Ok(());
    };

    let roots = load_root_store(&options.ca_file)?;
    let server = TunnelServer::new(options, hooks, manager.clone(), roots, apiserver);
    let Some(running) = server.start(&stop).await? else {
        return Ok(());
    };

    let result = running.wait().await;
    let _ = tokio::join!(manager_task, approver_task);
    info!("Tunnel server stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_listener::tests::test_pki;
    use clap::Parser;
    use excalibur_common::hooks::MockTunnelHooks;
    use excalibur_pki::credential::MockCredentialSource;
    use excalibur_pki::tls::root_store_from_pem;
    use excalibur_pki::authority::MockSigningAuthority;
    use excalibur_pki::PkiError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn loopback_options() -> ServerOptions {
        ServerOptions::try_parse_from([
            "excalibur-tunnel-server",
            "--bind-address",
            "127.0.0.1",
            "--agent-port",
            "0",
            "--master-port",
            "0",
            "--master-insecure-port",
            "0",
            "--proxy-port",
            "0",
        ])
        .expect("options")
    }

    #[tokio::test(start_paused = true)]
    async fn story_nothing_starts_before_the_certificate_is_signed() {
        let pki = test_pki();
        let cred = pki.ca.issue(
            &IdentityTemplate::agent("hub", "127.0.0.1".parse().expect("ip")),
            Duration::from_secs(3600),
        );
        let cred = Arc::new(cred);

        // Unsigned for the first three polls
        let polls = Arc::new(AtomicUsize::new(0));
        let mut source = MockCredentialSource::new();
        let counter = polls.clone();
        source.expect_current().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                None
            } else {
                Some(cred.clone())
            }
        });

        let mut hooks = MockTunnelHooks::new();
        let hook_polls = polls.clone();
        hooks.expect_post_start_server().times(1).returning(move || {
            assert!(hook_polls.load(Ordering::SeqCst) >= 4);
            Ok(())
        });

        let server = TunnelServer::new(
            loopback_options(),
            Arc::new(hooks),
            Arc::new(source),
            root_store_from_pem(pki.ca.cert_pem()).expect("roots"),
            None,
        );
        let stop = CancellationToken::new();
        let running = server
            .start(&stop)
            .await
            .expect("start")
            .expect("server should start");

        assert_ne!(running.agent_addr.port(), 0);
        assert_ne!(running.proxy_addr.port(), 0);
        assert_eq!(running.master_listeners.len(), 2);
        assert!(server.registry().is_empty());

        stop.cancel();
        running.wait().await.expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_unsigned_binds_nothing() {
        let pki = test_pki();
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(|| None);
        let mut hooks = MockTunnelHooks::new();
        hooks.expect_post_start_server().never();

        let server = TunnelServer::new(
            loopback_options(),
            Arc::new(hooks),
            Arc::new(source),
            root_store_from_pem(pki.ca.cert_pem()).expect("roots"),
            None,
        );
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        assert!(server.start(&stop).await.expect("start").is_none());
    }

    #[tokio::test]
    async fn test_post_start_hook_failure_is_fatal() {
        let pki = test_pki();
        let cred = Arc::new(pki.ca.issue(
            &IdentityTemplate::agent("hub", "127.0.0.1".parse().expect("ip")),
            Duration::from_secs(3600),
        ));
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(move || Some(cred.clone()));
        let mut hooks = MockTunnelHooks::new();
        hooks.expect_post_start_server().returning(|| {
            Err(excalibur_common::Error::hook(
                "test",
                "post-start-server",
                "provider unavailable",
            ))
        });

        let server = TunnelServer::new(
            loopback_options(),
            Arc::new(hooks),
            Arc::new(source),
            root_store_from_pem(pki.ca.cert_pem()).expect("roots"),
            None,
        );
        let stop = CancellationToken::new();
        let err = server.start(&stop).await.err().expect("start should fail");
        assert!(matches!(err, ServerError::Common(_)));
        stop.cancel();
    }

    #[tokio::test]
    async fn test_unix_socket_replaces_tcp_master_listeners() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = loopback_options();
        options.uds_name = Some(dir.path().join("master.sock"));

        let pki = test_pki();
        let cred = Arc::new(pki.ca.issue(
            &IdentityTemplate::agent("hub", "127.0.0.1".parse().expect("ip")),
            Duration::from_secs(3600),
        ));
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(move || Some(cred.clone()));
        let mut hooks = MockTunnelHooks::new();
        hooks.expect_post_start_server().returning(|| Ok(()));

        let server = TunnelServer::new(
            options,
            Arc::new(hooks),
            Arc::new(source),
            root_store_from_pem(pki.ca.cert_pem()).expect("roots"),
            None,
        );
        let stop = CancellationToken::new();
        let running = server.start(&stop).await.expect("start").expect("started");
        assert_eq!(running.master_listeners.len(), 1);
        assert!(running.master_listeners[0].starts_with("unix://"));

        stop.cancel();
        running.wait().await.expect("clean shutdown");
    }

    type PhaseLog = Arc<Mutex<Vec<&'static str>>>;

    /// Hub cluster double recording the order startup reaches it in
    struct RecordingCluster {
        log: PhaseLog,
        hooks: Arc<dyn TunnelHooks>,
        authority: Arc<dyn SigningAuthority>,
        submitted: Arc<Notify>,
    }

    impl RecordingCluster {
        fn new(log: &PhaseLog, hooks: MockTunnelHooks) -> Self {
            let submitted = Arc::new(Notify::new());
            let mut authority = MockSigningAuthority::new();
            let submit_log = log.clone();
            let notify = submitted.clone();
            authority.expect_submit().returning(move |_| {
                submit_log.lock().expect("log").push("manager-submit");
                notify.notify_one();
                Err(PkiError::Timeout("csr-test".to_string()))
            });
            Self {
                log: log.clone(),
                hooks: Arc::new(hooks),
                authority: Arc::new(authority),
                submitted,
            }
        }
    }

    #[async_trait]
    impl ServerCluster for RecordingCluster {
        fn hooks(&self) -> Arc<dyn TunnelHooks> {
            self.hooks.clone()
        }

        async fn server_sans(&self) -> excalibur_common::Result<ServerSans> {
            self.log.lock().expect("log").push("discovery");
            Ok(ServerSans {
                dns_names: vec!["tunnel.example.com".to_string()],
                ip_addresses: vec!["10.0.0.1".parse().expect("ip")],
            })
        }

        fn signing_authority(&self) -> Arc<dyn SigningAuthority> {
            self.authority.clone()
        }

        async fn start_approver(
            &self,
            _authority: Arc<dyn SigningAuthority>,
            workers: usize,
            stop: CancellationToken,
        ) -> Option<JoinHandle<()>> {
            assert_eq!(workers, 2);
            // The manager must already be running when the approver starts
            let manager_running =
                tokio::time::timeout(Duration::from_secs(5), self.submitted.notified())
                    .await
                    .is_ok();
            self.log.lock().expect("log").push(if manager_running {
                "approver"
            } else {
                "approver-without-manager"
            });
            stop.cancel();
            None
        }
    }

    fn recorded(log: &PhaseLog) -> Vec<&'static str> {
        let mut phases = log.lock().expect("log").clone();
        phases.dedup();
        phases
    }

    #[tokio::test]
    async fn story_startup_phases_run_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = loopback_options();
        options.pki_dir = Some(dir.path().to_path_buf());

        let log: PhaseLog = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = MockTunnelHooks::new();
        let hook_log = log.clone();
        hooks.expect_pre_start_server().times(1).returning(move || {
            hook_log.lock().expect("log").push("pre-start");
            Ok(())
        });
        hooks.expect_post_start_server().never();
        let cluster = RecordingCluster::new(&log, hooks);

        let stop = CancellationToken::new();
        run_server_with(options, &cluster, None, stop.clone())
            .await
            .expect("startup should end cleanly on stop");

        assert_eq!(
            recorded(&log),
            vec!["pre-start", "discovery", "manager-submit", "approver"]
        );
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_pre_start_hook_failure_aborts_before_discovery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = loopback_options();
        options.pki_dir = Some(dir.path().to_path_buf());

        let log: PhaseLog = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = MockTunnelHooks::new();
        hooks.expect_pre_start_server().times(1).returning(|| {
            Err(excalibur_common::Error::hook(
                "test",
                "pre-start-server",
                "provider unavailable",
            ))
        });
        let cluster = RecordingCluster::new(&log, hooks);

        let err = run_server_with(options, &cluster, None, CancellationToken::new())
            .await
            .err()
            .expect("startup should fail");
        assert!(matches!(err, ServerError::Common(_)));
        assert!(recorded(&log).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_touching_the_cluster() {
        let mut options = loopback_options();
        options.approver_workers = 0;
        let err = run_server(options, CancellationToken::new())
            .await
            .err()
            .expect("validation should fail");
        assert!(matches!(err, ServerError::Validation { .. }));
    }
}
