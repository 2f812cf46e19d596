//! Command line options for the tunnel server

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use excalibur_common::hooks::HookProviderKind;
use excalibur_common::{
    AGENT_PORT, DEFAULT_APPROVER_THREADINESS, IN_CLUSTER_CA_FILE, MASTER_INSECURE_PORT,
    MASTER_PORT, REVERSE_PROXY_PORT,
};
use excalibur_pki::authority::DEFAULT_SIGNER_NAME;
use excalibur_pki::store::default_store_dir;
use excalibur_pki::template::CertificateRole;

use crate::{Result, ServerError};

/// Default upstream for `/norm/api` requests
pub const DEFAULT_NORM_UPSTREAM: &str = "http://169.254.0.40:80";

/// How a master connection picks the agent that carries it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProxyStrategy {
    /// Any connected agent, round robin
    Default,
    /// The agent whose identifiers match the destination host
    #[default]
    #[value(name = "destHost")]
    DestHost,
}

/// Hub side of the excalibur tunnel
#[derive(Parser, Debug, Clone)]
#[command(name = "excalibur-tunnel-server", version, about, long_about = None)]
pub struct ServerOptions {
    /// Path to a kubeconfig for the hub cluster; in-cluster config when unset
    #[arg(long, env = "KUBE_CONFIG")]
    pub kube_config: Option<PathBuf>,

    /// Address the agent, master and reverse proxy listeners bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Address the plain-HTTP master listener binds to
    #[arg(long, env = "INSECURE_BIND_ADDRESS", default_value = "127.0.0.1")]
    pub insecure_bind_address: String,

    /// Extra DNS names for the server certificate (e.g. dns1,dns2)
    #[arg(long, value_delimiter = ',')]
    pub cert_dns_names: Vec<String>,

    /// Extra IPs for the server certificate (e.g. ip1,ip2)
    #[arg(long, value_delimiter = ',')]
    pub cert_ips: Vec<IpAddr>,

    /// How master connections are assigned to agents
    #[arg(long, value_enum, default_value_t)]
    pub proxy_strategy: ProxyStrategy,

    /// Serve masters on this unix socket instead of TCP
    #[arg(long, env = "UDS_NAME")]
    pub uds_name: Option<PathBuf>,

    /// Lifecycle hook provider (noop, tkestack)
    #[arg(long, env = "HOOK_PROVIDER", default_value = "noop")]
    pub hook_provider: HookProviderKind,

    /// Upstream for `/norm/api` requests on the reverse proxy
    #[arg(long, env = "NORM_UPSTREAM", default_value = DEFAULT_NORM_UPSTREAM)]
    pub norm_upstream: String,

    /// Signer named in the server's certificate signing requests
    #[arg(long, default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// CA bundle agents' certificates chain to
    #[arg(long, default_value = IN_CLUSTER_CA_FILE)]
    pub ca_file: PathBuf,

    /// Directory holding the server credential
    #[arg(long, env = "PKI_DIR")]
    pub pki_dir: Option<PathBuf>,

    /// Number of signing request approval workers
    #[arg(long, default_value_t = DEFAULT_APPROVER_THREADINESS)]
    pub approver_workers: usize,

    /// Port agents connect to
    #[arg(long, default_value_t = AGENT_PORT, hide = true)]
    pub agent_port: u16,

    /// Port of the mTLS master listener
    #[arg(long, default_value_t = MASTER_PORT, hide = true)]
    pub master_port: u16,

    /// Port of the plain-HTTP master listener
    #[arg(long, default_value_t = MASTER_INSECURE_PORT, hide = true)]
    pub master_insecure_port: u16,

    /// Port of the reverse proxy
    #[arg(long, default_value_t = REVERSE_PROXY_PORT, hide = true)]
    pub proxy_port: u16,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    pub log_text: bool,
}

impl ServerOptions {
    /// Reject option combinations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.trim().is_empty() {
            return Err(ServerError::validation("bind-address", "must not be empty"));
        }
        self.bind_ip()?;
        if self.uds_name.is_none() {
            self.insecure_bind_ip()?;
        }
        if let Some(uds) = &self.uds_name {
            if uds.as_os_str().is_empty() {
                return Err(ServerError::validation("uds-name", "must not be empty"));
            }
        }
        reqwest::Url::parse(&self.norm_upstream)
            .map_err(|e| ServerError::validation("norm-upstream", e.to_string()))?;
        if self.signer_name.is_empty() {
            return Err(ServerError::validation("signer-name", "must not be empty"));
        }
        if self.approver_workers == 0 {
            return Err(ServerError::validation("approver-workers", "must be at least 1"));
        }
        Ok(())
    }

    fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .trim()
            .parse()
            .map_err(|e| ServerError::validation("bind-address", format!("{}", e)))
    }

    fn insecure_bind_ip(&self) -> Result<IpAddr> {
        self.insecure_bind_address
            .trim()
            .parse()
            .map_err(|e| ServerError::validation("insecure-bind-address", format!("{}", e)))
    }

    /// Address agents connect to
    pub fn agent_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.agent_port))
    }

    /// Address of the mTLS master listener
    pub fn master_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.master_port))
    }

    /// Address of the plain-HTTP master listener
    pub fn master_insecure_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.insecure_bind_ip()?, self.master_insecure_port))
    }

    /// Address of the reverse proxy
    pub fn proxy_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.proxy_port))
    }

    /// Directory for the server credential
    pub fn pki_dir(&self) -> PathBuf {
        self.pki_dir
            .clone()
            .unwrap_or_else(|| default_store_dir(CertificateRole::Server.component()))
    }
}
