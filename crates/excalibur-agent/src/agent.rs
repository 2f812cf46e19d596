//! Agent startup orchestration
//!
//! [`run_agent`] validates options, runs the pre-start hook, resolves the
//! tunnel server, obtains a signed certificate and then keeps the tunnel
//! open until stopped.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use excalibur_common::discovery::TunnelServerAddress;
use excalibur_common::env::{server_namespace, K8sEnvConfig, OsEnvConfig};
use excalibur_common::hooks::TunnelHooks;
use excalibur_common::CERT_POLL_INTERVAL;
use excalibur_pki::template::TemplateFn;
use excalibur_pki::tls::{load_root_store, TransportSecurity};
use excalibur_pki::{
    wait_for_current, CertificateManager, CertificateManagerConfig, CredentialSource,
    CredentialStore, IdentityTemplate,
};
use excalibur_transport::AgentIdentifiers;
use rustls::RootCertStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::{build_clients, AgentCluster, KubeAgentCluster};
use crate::options::AgentOptions;
use crate::tunnel::TunnelClient;
use crate::{AgentError, Result};

/// File name prefix of the persisted agent credential
const CREDENTIAL_PREFIX: &str = "tunnel";

/// Address of this pod, required for the agent certificate
pub fn pod_ip(env: &dyn K8sEnvConfig) -> Result<IpAddr> {
    let raw = env
        .pod_ip()
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| AgentError::validation("POD_IP", "environment variable is not set"))?;
    raw.parse()
        .map_err(|e| AgentError::validation("POD_IP", format!("{}: {}", raw, e)))
}

/// Tunnel half of the agent, started once a certificate exists
pub struct TunnelAgent {
    cluster_name: String,
    identifiers: AgentIdentifiers,
    server: TunnelServerAddress,
    roots: RootCertStore,
    hooks: Arc<dyn TunnelHooks>,
    credentials: Arc<dyn CredentialSource>,
    poll_interval: Duration,
}

impl TunnelAgent {
    /// Create an agent for `cluster_name` dialing `server`
    pub fn new(
        cluster_name: impl Into<String>,
        identifiers: AgentIdentifiers,
        server: TunnelServerAddress,
        roots: RootCertStore,
        hooks: Arc<dyn TunnelHooks>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            identifiers,
            server,
            roots,
            hooks,
            credentials,
            poll_interval: CERT_POLL_INTERVAL,
        }
    }

    /// Override how often the certificate is checked while waiting
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait for a certificate, open the tunnel and run the post-start hook
    ///
    /// Returns `Ok(None)` if `stop` fires before a certificate is available.
    pub async fn start(&self, stop: &CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let Some(cred) = wait_for_current(self.credentials.as_ref(), self.poll_interval, stop).await
        else {
            return Ok(None);
        };
        info!(
            common_name = %cred.common_name(),
            not_after = %cred.not_after(),
            "Agent certificate available"
        );

        let security = TransportSecurity::new(self.roots.clone(), Arc::clone(&self.credentials));
        let tls = Arc::new(security.client_config()?);
        let client = TunnelClient::new(
            self.server.clone(),
            tls,
            &self.cluster_name,
            &self.identifiers,
        );
        let tunnel = client.start(stop.clone());

        self.hooks.post_start_agent(&self.cluster_name).await?;
        info!(
            cluster = %self.cluster_name,
            server = %self.server,
            identifiers = %self.identifiers,
            "Tunnel agent started"
        );
        Ok(Some(tunnel))
    }
}

/// Run the tunnel agent until `stop` fires
pub async fn run_agent(options: AgentOptions, stop: CancellationToken) -> Result<()> {
    options.validate()?;
    let env = OsEnvConfig;
    let pod_ip = pod_ip(&env)?;

    let clients = build_clients(&options).await?;
    let cluster = KubeAgentCluster::new(clients, options.hook_provider, server_namespace(&env));
    run_agent_with(options, pod_ip, &cluster, stop).await
}

/// Start the agent against `cluster`
///
/// Phases run in order: pre-start hook, server discovery (unless the
/// address was given), certificate manager, then the tunnel once a
/// certificate exists.
pub async fn run_agent_with(
    options: AgentOptions,
    pod_ip: IpAddr,
    cluster: &dyn AgentCluster,
    stop: CancellationToken,
) -> Result<()> {
    let identifiers = options.identifiers()?;
    let cluster_name = options.cluster_name.trim().to_string();

    let hooks = cluster.hooks();
    info!(cluster = %cluster_name, "Running pre-start hook");
    hooks.pre_start_agent(&cluster_name).await?;

    let server = match options.server_addr()? {
        Some(addr) => addr,
        None => cluster.tunnel_server_addr().await?,
    };
    info!(server = %server, "Resolved tunnel server address");

    let template_cluster = cluster_name.clone();
    let template: TemplateFn =
        Arc::new(move || Ok(IdentityTemplate::agent(&template_cluster, pod_ip)));
    let store = Arc::new(CredentialStore::open(options.pki_dir(), CREDENTIAL_PREFIX)?);
    let manager = Arc::new(CertificateManager::new(
        cluster.signing_authority(),
        store,
        template,
        CertificateManagerConfig {
            signer_name: options.signer_name.clone(),
            ..Default::default()
        },
    ));
    let manager_task = manager.start(stop.clone());

    let roots = load_root_store(&options.ca_file)?;
    let agent = TunnelAgent::new(cluster_name, identifiers, server, roots, hooks, manager);
    let Some(tunnel) = agent.start(&stop).await? else {
        return Ok(());
    };

    let _ = tokio::join!(tunnel, manager_task);
    info!("Tunnel agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tests::start_hub;
    use excalibur_common::env::MockK8sEnvConfig;
    use excalibur_common::hooks::MockTunnelHooks;
    use excalibur_pki::credential::MockCredentialSource;
    use async_trait::async_trait;
    use clap::Parser;
    use excalibur_pki::authority::{MockSigningAuthority, SigningAuthority};
    use excalibur_pki::credential::testing::TestCa;
    use excalibur_pki::tls::root_store_from_pem;
    use excalibur_pki::PkiError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_pod_ip_is_required() {
        let mut env = MockK8sEnvConfig::new();
        env.expect_pod_ip().returning(|| None);
        assert!(matches!(pod_ip(&env), Err(AgentError::Validation { .. })));

        let mut env = MockK8sEnvConfig::new();
        env.expect_pod_ip().returning(|| Some("not-an-ip".to_string()));
        assert!(pod_ip(&env).is_err());

        let mut env = MockK8sEnvConfig::new();
        env.expect_pod_ip().returning(|| Some("10.1.2.3".to_string()));
        assert_eq!(pod_ip(&env).expect("ip"), "10.1.2.3".parse::<IpAddr>().expect("ip"));
    }

    #[tokio::test]
    async fn story_agent_connects_once_its_certificate_is_signed() {
        let mut hub = start_hub().await;
        let cred = Arc::new(hub.ca.issue(
            &IdentityTemplate::agent("cluster-a", "10.0.0.9".parse().expect("ip")),
            Duration::from_secs(3600),
        ));

        // Unsigned for the first two polls
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                None
            } else {
                Some(cred.clone())
            }
        });

        let mut hooks = MockTunnelHooks::new();
        hooks
            .expect_post_start_agent()
            .with(mockall::predicate::eq("cluster-a"))
            .times(1)
            .returning(|_| Ok(()));

        let agent = TunnelAgent::new(
            "cluster-a",
            AgentIdentifiers::parse("host=cluster-a,cidr=10.0.0.0/8").expect("ids"),
            hub.addr.clone(),
            root_store_from_pem(hub.ca.cert_pem()).expect("roots"),
            Arc::new(hooks),
            Arc::new(source),
        )
        .with_poll_interval(Duration::from_millis(10));
        let stop = CancellationToken::new();
        let tunnel = agent
            .start(&stop)
            .await
            .expect("start")
            .expect("agent should start");

        assert!(polls.load(Ordering::SeqCst) >= 3);
        let (hello, _session) = hub.sessions.recv().await.expect("agent connected");
        assert_eq!(hello.cluster_name, "cluster-a");
        assert_eq!(hello.identifiers, "host=cluster-a,cidr=10.0.0.0/8");

        stop.cancel();
        tunnel.await.expect("tunnel task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_unsigned_never_connects() {
        let mut source = MockCredentialSource::new();
        source.expect_current().returning(|| None);
        let mut hooks = MockTunnelHooks::new();
        hooks.expect_post_start_agent().never();

        let ca = excalibur_pki::credential::testing::TestCa::new("unused");
        let agent = TunnelAgent::new(
            "cluster-a",
            AgentIdentifiers::default(),
            TunnelServerAddress {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            root_store_from_pem(ca.cert_pem()).expect("roots"),
            Arc::new(hooks),
            Arc::new(source),
        );
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });
        assert!(agent.start(&stop).await.expect("start").is_none());
    }

    type PhaseLog = Arc<Mutex<Vec<&'static str>>>;

    /// Hub cluster double recording the order startup reaches it in
    struct RecordingCluster {
        log: PhaseLog,
        hooks: Arc<dyn TunnelHooks>,
        authority: Arc<dyn SigningAuthority>,
    }

    impl RecordingCluster {
        /// The first signing request submission stops the agent
        fn new(log: &PhaseLog, stop: &CancellationToken) -> Self {
            let mut hooks = MockTunnelHooks::new();
            let hook_log = log.clone();
            hooks
                .expect_pre_start_agent()
                .with(mockall::predicate::eq("cluster-a"))
                .times(1)
                .returning(move |_| {
                    hook_log.lock().expect("log").push("pre-start");
                    Ok(())
                });
            hooks.expect_post_start_agent().never();

            let mut authority = MockSigningAuthority::new();
            let submit_log = log.clone();
            let stop = stop.clone();
            authority.expect_submit().returning(move |_| {
                submit_log.lock().expect("log").push("manager-submit");
                stop.cancel();
                Err(PkiError::Timeout("csr-test".to_string()))
            });

            Self {
                log: log.clone(),
                hooks: Arc::new(hooks),
                authority: Arc::new(authority),
            }
        }
    }

    #[async_trait]
    impl AgentCluster for RecordingCluster {
        fn hooks(&self) -> Arc<dyn TunnelHooks> {
            self.hooks.clone()
        }

        async fn tunnel_server_addr(&self) -> excalibur_common::Result<TunnelServerAddress> {
            self.log.lock().expect("log").push("discovery");
            Ok(TunnelServerAddress {
                host: "127.0.0.1".to_string(),
                port: 1,
            })
        }

        fn signing_authority(&self) -> Arc<dyn SigningAuthority> {
            self.authority.clone()
        }
    }

    fn startup_options(dir: &std::path::Path, extra: &[&str]) -> AgentOptions {
        let ca = TestCa::new("hub-ca");
        let ca_file = dir.join("ca.crt");
        std::fs::write(&ca_file, ca.cert_pem()).expect("write ca");
        let pki_dir = dir.join("pki");
        let mut args = vec![
            "excalibur-tunnel-agent".to_string(),
            "--cluster-name".to_string(),
            "cluster-a".to_string(),
            "--ca-file".to_string(),
            ca_file.display().to_string(),
            "--pki-dir".to_string(),
            pki_dir.display().to_string(),
        ];
        args.extend(extra.iter().map(|a| a.to_string()));
        AgentOptions::try_parse_from(args).expect("options")
    }

    fn recorded(log: &PhaseLog) -> Vec<&'static str> {
        let mut phases = log.lock().expect("log").clone();
        phases.dedup();
        phases
    }

    #[tokio::test]
    async fn story_startup_phases_run_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = startup_options(dir.path(), &[]);
        let log: PhaseLog = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let cluster = RecordingCluster::new(&log, &stop);

        run_agent_with(options, "10.1.2.3".parse().expect("ip"), &cluster, stop)
            .await
            .expect("startup should end cleanly on stop");

        assert_eq!(recorded(&log), vec!["pre-start", "discovery", "manager-submit"]);
    }

    #[tokio::test]
    async fn test_configured_server_address_skips_discovery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = startup_options(dir.path(), &["--tunnelserver-addr", "127.0.0.1:9"]);
        let log: PhaseLog = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let cluster = RecordingCluster::new(&log, &stop);

        run_agent_with(options, "10.1.2.3".parse().expect("ip"), &cluster, stop)
            .await
            .expect("startup should end cleanly on stop");

        assert_eq!(recorded(&log), vec!["pre-start", "manager-submit"]);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_touching_the_cluster() {
        let options = AgentOptions::try_parse_from(["excalibur-tunnel-agent"]).expect("parse");
        let err = run_agent(options, CancellationToken::new())
            .await
            .err()
            .expect("validation should fail");
        assert!(matches!(err, AgentError::Validation { .. }));
    }
}
