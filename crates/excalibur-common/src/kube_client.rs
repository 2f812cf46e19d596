//! Kubernetes client construction
//!
//! The server and agent talk to up to two API servers: the hub ("cloud")
//! cluster that signs certificates, and the cluster the process runs in.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
///
/// Falls back to in-cluster (or inferred) configuration when no path is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::client_config("kubeconfig", format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::client_config("kubeconfig", format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::client_config("in-cluster", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    build(config, "kubeconfig")
}

/// Create a kube client for the cluster this pod runs in
pub fn create_in_cluster_client() -> Result<Client, Error> {
    let mut config = Config::incluster().map_err(|e| {
        Error::client_config("in-cluster", format!("failed to load in-cluster config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    build(config, "in-cluster")
}

/// Build the client config for a remote API server address
///
/// Authenticates with a bearer token read from `token_file` (re-read by
/// kube on rotation) and trusts only the CA in `ca_file`.
pub fn apiserver_config(
    apiserver_addr: &str,
    ca_file: &Path,
    token_file: &Path,
) -> Result<Config, Error> {
    let url = normalize_apiserver_url(apiserver_addr);
    let uri: http::Uri = url
        .parse()
        .map_err(|e| Error::client_config("apiserver", format!("invalid address {}: {}", url, e)))?;

    let ca_pem = std::fs::read(ca_file).map_err(|e| {
        Error::client_config(
            "apiserver",
            format!("failed to read CA {}: {}", ca_file.display(), e),
        )
    })?;
    let roots = pem_certificates(&ca_pem);
    if roots.is_empty() {
        return Err(Error::client_config(
            "apiserver",
            format!("no certificates found in {}", ca_file.display()),
        ));
    }

    let mut config = Config::new(uri);
    config.root_cert = Some(roots);
    config.auth_info.token_file = Some(token_file.to_string_lossy().into_owned());
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Create a kube client for a remote API server address
pub fn create_apiserver_client(
    apiserver_addr: &str,
    ca_file: &Path,
    token_file: &Path,
) -> Result<Client, Error> {
    build(apiserver_config(apiserver_addr, ca_file, token_file)?, "apiserver")
}

fn build(config: Config, context: &str) -> Result<Client, Error> {
    Client::try_from(config)
        .map_err(|e| Error::client_config(context, format!("failed to create client: {}", e)))
}

/// Prefix bare `host:port` addresses with `https://`
pub fn normalize_apiserver_url(addr: &str) -> String {
    if addr.starts_with("https://") || addr.starts_with("http://") {
        addr.to_string()
    } else {
        format!("https://{}", addr)
    }
}

/// DER bodies of every CERTIFICATE block in a PEM bundle
fn pem_certificates(pem_bundle: &[u8]) -> Vec<Vec<u8>> {
    pem::parse_many(pem_bundle)
        .unwrap_or_default()
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_CA: &str = "-----BEGIN CERTIFICATE-----\nAAECAw==\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_normalize_apiserver_url() {
        assert_eq!(
            normalize_apiserver_url("10.0.0.1:6443"),
            "https://10.0.0.1:6443"
        );
        assert_eq!(
            normalize_apiserver_url("https://hub.example.com"),
            "https://hub.example.com"
        );
    }

    #[test]
    fn test_pem_certificates_extracts_every_block() {
        let bundle = format!("{}{}", TEST_CA, TEST_CA);
        let certs = pem_certificates(bundle.as_bytes());
        assert_eq!(certs, vec![vec![0, 1, 2, 3], vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_apiserver_config_uses_token_file_and_ca() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ca = dir.path().join("ca.crt");
        let token = dir.path().join("token");
        std::fs::File::create(&ca)
            .and_then(|mut f| f.write_all(TEST_CA.as_bytes()))
            .expect("write ca");

        let config = apiserver_config("10.0.0.1:6443", &ca, &token).expect("config");
        assert_eq!(config.cluster_url.to_string(), "https://10.0.0.1:6443/");
        assert_eq!(config.root_cert.map(|r| r.len()), Some(1));
        assert_eq!(
            config.auth_info.token_file.as_deref(),
            Some(token.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn test_apiserver_config_rejects_empty_ca() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ca = dir.path().join("ca.crt");
        std::fs::write(&ca, "not a pem").expect("write ca");

        let err = apiserver_config("10.0.0.1:6443", &ca, &dir.path().join("token"))
            .expect_err("empty CA must fail");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_apiserver_config_missing_ca_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(apiserver_config(
            "10.0.0.1:6443",
            &dir.path().join("missing"),
            &dir.path().join("token")
        )
        .is_err());
    }
}
