//! Kubernetes clients the agent talks to
//!
//! The "cloud" client reaches the hub cluster, which signs the agent's
//! certificate and publishes the tunnel server address. The "local" client
//! reaches the cluster the agent runs in, when there is one.

use std::sync::Arc;

use async_trait::async_trait;
use excalibur_common::discovery::{get_tunnel_server_addr, TunnelServerAddress};
use excalibur_common::hooks::{build_hooks, HookProviderKind, TunnelHooks};
use excalibur_common::kube_client::{
    create_apiserver_client, create_client, create_in_cluster_client,
};
use excalibur_pki::authority::{KubeSigningAuthority, SigningAuthority};
use kube::Client;
use tracing::{debug, info};

use crate::options::AgentOptions;
use crate::Result;

/// Clients for the hub and the local cluster
#[derive(Clone)]
pub struct AgentClients {
    /// Hub cluster
    pub cloud: Client,
    /// Cluster the agent runs in, if in-cluster config is available
    pub local: Option<Client>,
}

/// Build the agent's clients from its options
///
/// `--apiserver-addr` wins and authenticates with the agent's own service
/// account token and CA. Otherwise the kubeconfig (or in-cluster config)
/// is used for the hub.
pub async fn build_clients(options: &AgentOptions) -> Result<AgentClients> {
    let cloud = match options.apiserver_addr.as_deref().filter(|a| !a.is_empty()) {
        Some(addr) => {
            info!(apiserver = %addr, "Creating hub client from API server address");
            create_apiserver_client(addr, &options.ca_file, &options.token_file)?
        }
        None => {
            info!(
                kubeconfig = ?options.kube_config,
                "Creating hub client from kubeconfig"
            );
            create_client(options.kube_config.as_deref()).await?
        }
    };

    let local = match create_in_cluster_client() {
        Ok(client) => Some(client),
        Err(e) => {
            debug!(error = %e, "No local cluster client");
            None
        }
    };

    Ok(AgentClients { cloud, local })
}

/// What agent startup needs from the hub cluster
#[async_trait]
pub trait AgentCluster: Send + Sync {
    /// Hooks of the configured provider
    fn hooks(&self) -> Arc<dyn TunnelHooks>;

    /// Address published for the tunnel server
    async fn tunnel_server_addr(&self) -> excalibur_common::Result<TunnelServerAddress>;

    /// Authority that signs the agent certificate
    fn signing_authority(&self) -> Arc<dyn SigningAuthority>;
}

/// [`AgentCluster`] reached through the agent's hub client
pub struct KubeAgentCluster {
    clients: AgentClients,
    hooks: Arc<dyn TunnelHooks>,
    namespace: String,
}

impl KubeAgentCluster {
    /// Use `clients.cloud` for discovery, signing and hooks
    pub fn new(clients: AgentClients, hook_provider: HookProviderKind, namespace: String) -> Self {
        let hooks = build_hooks(hook_provider, clients.cloud.clone());
        info!(
            provider = hooks.provider_name(),
            local_cluster = clients.local.is_some(),
            %namespace,
            "Using hub cluster"
        );
        Self {
            clients,
            hooks,
            namespace,
        }
    }
}

#[async_trait]
impl AgentCluster for KubeAgentCluster {
    fn hooks(&self) -> Arc<dyn TunnelHooks> {
        Arc::clone(&self.hooks)
    }

    async fn tunnel_server_addr(&self) -> excalibur_common::Result<TunnelServerAddress> {
        get_tunnel_server_addr(&self.clients.cloud, &self.namespace).await
    }

    fn signing_authority(&self) -> Arc<dyn SigningAuthority> {
        Arc::new(KubeSigningAuthority::new(self.clients.cloud.clone()))
    }
}
