//! Lifecycle hooks
//!
//! Distributions customise startup by running logic before and after the
//! tunnel server or agent comes up. Providers are built with whatever
//! clients they need; the orchestrators only call the hook points.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use tracing::info;

use crate::{Error, IN_CLUSTER_TOKEN_FILE};

/// Hook points around tunnel startup
///
/// Every method defaults to a no-op.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait TunnelHooks: Send + Sync {
    /// Provider name, for logs
    fn provider_name(&self) -> &str;

    /// Runs before the agent resolves the server address
    async fn pre_start_agent(&self, _cluster_name: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Runs once the agent tunnel is up
    async fn post_start_agent(&self, _cluster_name: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Runs before the server starts its certificate manager
    async fn pre_start_server(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs once every server listener is up
    async fn post_start_server(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Which hook provider to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookProviderKind {
    /// No customisation
    #[default]
    Noop,
    /// TKEStack: publishes the local admin token to the hub after the agent starts
    TkeStack,
}

impl FromStr for HookProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "noop" | "none" => Ok(Self::Noop),
            "tkestack" => Ok(Self::TkeStack),
            other => Err(Error::validation(
                "--hook-provider",
                format!("unknown hook provider {}", other),
            )),
        }
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl TunnelHooks for NoopHooks {
    fn provider_name(&self) -> &str {
        "noop"
    }
}

/// Access to TKEStack `ClusterCredential` objects on the hub
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ClusterCredentialApi: Send + Sync {
    /// Name of the credential object for `cluster_name`, if one exists
    async fn find_credential(&self, cluster_name: &str) -> Result<Option<String>, Error>;

    /// Replace the token stored in credential `name`
    async fn patch_token(&self, name: &str, token: &str) -> Result<(), Error>;
}

/// [`ClusterCredentialApi`] backed by the hub API server
#[derive(Clone)]
pub struct KubeClusterCredentialApi {
    client: Client,
}

impl KubeClusterCredentialApi {
    /// Wrap a hub client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("platform.tkestack.io", "v1", "ClusterCredential");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "clustercredentials");
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl ClusterCredentialApi for KubeClusterCredentialApi {
    async fn find_credential(&self, cluster_name: &str) -> Result<Option<String>, Error> {
        let params = ListParams::default().fields(&format!("clusterName={}", cluster_name));
        let list = self.api().list(&params).await?;
        Ok(list.items.into_iter().find_map(|cc| cc.metadata.name))
    }

    async fn patch_token(&self, name: &str, token: &str) -> Result<(), Error> {
        let patch = serde_json::json!({ "token": token });
        self.api()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// TKEStack hooks
///
/// After the agent starts, the hub's `ClusterCredential` for this cluster is
/// updated with the local service account token so the hub can reach the
/// cluster's API server through the tunnel.
pub struct TkeStackHooks<A> {
    api: A,
    token_file: PathBuf,
}

impl<A: ClusterCredentialApi> TkeStackHooks<A> {
    /// Create hooks reading the token from `token_file`
    pub fn new(api: A, token_file: impl Into<PathBuf>) -> Self {
        Self {
            api,
            token_file: token_file.into(),
        }
    }
}

#[async_trait]
impl<A: ClusterCredentialApi> TunnelHooks for TkeStackHooks<A> {
    fn provider_name(&self) -> &str {
        "tkestack"
    }

    async fn post_start_agent(&self, cluster_name: &str) -> Result<(), Error> {
        let phase = "post-start-agent";
        let name = self
            .api
            .find_credential(cluster_name)
            .await
            .map_err(|e| {
                Error::hook(
                    "tkestack",
                    phase,
                    format!("failed to get cluster {} credential: {}", cluster_name, e),
                )
            })?
            .ok_or_else(|| {
                Error::hook(
                    "tkestack",
                    phase,
                    format!("cluster credential for cluster {} is not ready", cluster_name),
                )
            })?;

        let token = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|e| {
                Error::hook(
                    "tkestack",
                    phase,
                    format!("failed to read token from {}: {}", self.token_file.display(), e),
                )
            })?;

        self.api
            .patch_token(&name, token.trim())
            .await
            .map_err(|e| {
                Error::hook(
                    "tkestack",
                    phase,
                    format!("patch cluster credential for cluster {} failed: {}", cluster_name, e),
                )
            })?;

        info!(cluster = %cluster_name, credential = %name, "Published cluster token to hub");
        Ok(())
    }
}

/// Build the hooks for `kind`
///
/// `hub` is the client for the cluster that holds tunnel metadata.
pub fn build_hooks(kind: HookProviderKind, hub: Client) -> Arc<dyn TunnelHooks> {
    match kind {
        HookProviderKind::Noop => Arc::new(NoopHooks),
        HookProviderKind::TkeStack => Arc::new(TkeStackHooks::new(
            KubeClusterCredentialApi::new(hub),
            IN_CLUSTER_TOKEN_FILE,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("".parse::<HookProviderKind>().ok(), Some(HookProviderKind::Noop));
        assert_eq!(
            "TKEStack".parse::<HookProviderKind>().ok(),
            Some(HookProviderKind::TkeStack)
        );
        assert!("rancher".parse::<HookProviderKind>().is_err());
    }

    #[tokio::test]
    async fn test_noop_hooks_succeed() {
        let hooks = NoopHooks;
        assert!(hooks.pre_start_agent("c").await.is_ok());
        assert!(hooks.post_start_agent("c").await.is_ok());
        assert!(hooks.pre_start_server().await.is_ok());
        assert!(hooks.post_start_server().await.is_ok());
    }

    #[tokio::test]
    async fn story_tkestack_publishes_token_after_agent_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "secret-token\n").expect("write token");

        let mut api = MockClusterCredentialApi::new();
        api.expect_find_credential()
            .with(eq("cluster-a"))
            .returning(|_| Ok(Some("cc-cluster-a".to_string())));
        api.expect_patch_token()
            .with(eq("cc-cluster-a"), eq("secret-token"))
            .times(1)
            .returning(|_, _| Ok(()));

        let hooks = TkeStackHooks::new(api, &token_file);
        hooks
            .post_start_agent("cluster-a")
            .await
            .expect("hook should succeed");
    }

    #[tokio::test]
    async fn test_tkestack_missing_credential_fails() {
        let mut api = MockClusterCredentialApi::new();
        api.expect_find_credential().returning(|_| Ok(None));
        api.expect_patch_token().never();

        let hooks = TkeStackHooks::new(api, "/nonexistent/token");
        let err = hooks
            .post_start_agent("cluster-a")
            .await
            .expect_err("missing credential must fail");
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_tkestack_unreadable_token_fails() {
        let mut api = MockClusterCredentialApi::new();
        api.expect_find_credential()
            .returning(|_| Ok(Some("cc".to_string())));
        api.expect_patch_token().never();

        let hooks = TkeStackHooks::new(api, "/nonexistent/token");
        assert!(hooks.post_start_agent("cluster-a").await.is_err());
    }

    #[tokio::test]
    async fn test_tkestack_other_phases_are_noops() {
        let mut api = MockClusterCredentialApi::new();
        api.expect_find_credential().never();
        let hooks = TkeStackHooks::new(api, "/nonexistent/token");
        assert!(hooks.pre_start_agent("c").await.is_ok());
        assert!(hooks.pre_start_server().await.is_ok());
        assert!(hooks.post_start_server().await.is_ok());
    }
}
