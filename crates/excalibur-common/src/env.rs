//! Environment configuration
//!
//! Provides trait-based access to environment configuration,
//! enabling dependency injection and mocking for tests.

use crate::DEFAULT_NAMESPACE;

/// Trait for reading the environment the tunnel components run in
///
/// This abstracts reading from environment variables, enabling
/// proper unit testing without manipulating global state.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
pub trait K8sEnvConfig: Send + Sync {
    /// Get the Kubernetes service host from environment
    fn kubernetes_service_host(&self) -> Option<String>;

    /// Get the Kubernetes service port from environment (defaults to 443)
    fn kubernetes_service_port(&self) -> String;

    /// Address of this pod, used as the agent's IP SAN
    fn pod_ip(&self) -> Option<String>;

    /// Namespace hint for tunnel server discovery
    fn tunnel_server_namespace(&self) -> Option<String>;
}

/// Build the K8s API server endpoint URL from config
///
/// Returns `None` if the host is not set.
pub fn api_server_endpoint(config: &dyn K8sEnvConfig) -> Option<String> {
    let host = config.kubernetes_service_host()?;
    let port = config.kubernetes_service_port();
    // IPv6 literals need brackets inside a URL authority
    if host.contains(':') && !host.starts_with('[') {
        Some(format!("https://[{}]:{}", host, port))
    } else {
        Some(format!("https://{}:{}", host, port))
    }
}

/// Namespace holding the tunnel server service
pub fn server_namespace(config: &dyn K8sEnvConfig) -> String {
    config
        .tunnel_server_namespace()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl K8sEnvConfig for OsEnvConfig {
    fn kubernetes_service_host(&self) -> Option<String> {
        std::env::var("KUBERNETES_SERVICE_HOST").ok()
    }

    fn kubernetes_service_port(&self) -> String {
        std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string())
    }

    fn pod_ip(&self) -> Option<String> {
        std::env::var("POD_IP").ok().filter(|ip| !ip.is_empty())
    }

    fn tunnel_server_namespace(&self) -> Option<String> {
        std::env::var("TUNNEL_SERVER_NAMESPACE").ok()
    }
}
