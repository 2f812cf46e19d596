//! Command line options for the tunnel agent

use std::path::PathBuf;

use clap::Parser;
use excalibur_common::discovery::TunnelServerAddress;
use excalibur_common::hooks::HookProviderKind;
use excalibur_common::{AGENT_CA_FILE, AGENT_PORT, AGENT_TOKEN_FILE};
use excalibur_pki::authority::DEFAULT_SIGNER_NAME;
use excalibur_pki::store::default_store_dir;
use excalibur_pki::template::CertificateRole;
use excalibur_transport::AgentIdentifiers;

use crate::{AgentError, Result};

/// Cluster side of the excalibur tunnel
#[derive(Parser, Debug, Clone)]
#[command(name = "excalibur-tunnel-agent", version, about, long_about = None)]
pub struct AgentOptions {
    /// Name of the cluster this agent serves
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// Tunnel server address (host:port); discovered from the hub when unset
    #[arg(long = "tunnelserver-addr", env = "TUNNEL_SERVER_ADDR")]
    pub tunnel_server_addr: Option<String>,

    /// Reachable address of the hub API server
    #[arg(long, env = "APISERVER_ADDR")]
    pub apiserver_addr: Option<String>,

    /// Path to a kubeconfig; in-cluster config when unset
    #[arg(long, env = "KUBE_CONFIG")]
    pub kube_config: Option<PathBuf>,

    /// Identifiers the server matches destinations against
    /// (e.g. host=cluster-a,cidr=10.0.0.0/8); defaults to host=<cluster-name>
    #[arg(long, env = "AGENT_IDENTIFIERS", default_value = "")]
    pub agent_identifiers: String,

    /// Lifecycle hook provider (noop, tkestack)
    #[arg(long, env = "HOOK_PROVIDER", default_value = "noop")]
    pub hook_provider: HookProviderKind,

    /// Signer named in the agent's certificate signing requests
    #[arg(long, default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// CA bundle the hub's certificates chain to
    #[arg(long, default_value = AGENT_CA_FILE)]
    pub ca_file: PathBuf,

    /// Service account token used with --apiserver-addr
    #[arg(long, default_value = AGENT_TOKEN_FILE)]
    pub token_file: PathBuf,

    /// Directory holding the agent credential
    #[arg(long, env = "PKI_DIR")]
    pub pki_dir: Option<PathBuf>,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    pub log_text: bool,
}

impl AgentOptions {
    /// Reject options the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(AgentError::validation("cluster-name", "is not set"));
        }
        self.identifiers()?;
        if let Some(addr) = &self.tunnel_server_addr {
            self.parse_server_addr(addr)?;
        }
        if self.signer_name.is_empty() {
            return Err(AgentError::validation("signer-name", "must not be empty"));
        }
        Ok(())
    }

    /// Parsed identifiers, defaulting to `host=<cluster-name>`
    pub fn identifiers(&self) -> Result<AgentIdentifiers> {
        let raw = if self.agent_identifiers.trim().is_empty() {
            format!("host={}", self.cluster_name.trim())
        } else {
            self.agent_identifiers.clone()
        };
        AgentIdentifiers::parse(&raw).map_err(|e| {
            AgentError::validation(
                "agent-identifiers",
                format!("{} (format should be host={{cluster-name}})", e),
            )
        })
    }

    /// Server address from the flag, if given
    pub fn server_addr(&self) -> Result<Option<TunnelServerAddress>> {
        self.tunnel_server_addr
            .as_deref()
            .map(|addr| self.parse_server_addr(addr))
            .transpose()
    }

    fn parse_server_addr(&self, addr: &str) -> Result<TunnelServerAddress> {
        TunnelServerAddress::parse(addr.trim(), Some(AGENT_PORT))
            .map_err(|e| AgentError::validation("tunnelserver-addr", e))
    }

    /// Directory for the agent credential
    pub fn pki_dir(&self) -> PathBuf {
        self.pki_dir
            .clone()
            .unwrap_or_else(|| default_store_dir(CertificateRole::Agent.component()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AgentOptions {
        let mut argv = vec!["excalibur-tunnel-agent"];
        argv.extend_from_slice(args);
        AgentOptions::try_parse_from(argv).expect("options should parse")
    }

    #[test]
    fn test_cluster_name_is_required() {
        let options = parse(&[]);
        assert!(matches!(
            options.validate(),
            Err(AgentError::Validation { ref field, .. }) if field == "cluster-name"
        ));
    }

    #[test]
    fn test_identifiers_default_to_cluster_host() {
        let options = parse(&["--cluster-name", "cluster-a"]);
        assert!(options.validate().is_ok());
        let ids = options.identifiers().expect("identifiers");
        assert_eq!(ids.to_string(), "host=cluster-a");
        assert!(ids.matches("cluster-a"));
    }

    #[test]
    fn test_identifier_validation() {
        for valid in ["host=cluster-a", "host=cluster-a,cidr=10.0.0.0/8"] {
            let options = parse(&["--cluster-name", "c", "--agent-identifiers", valid]);
            assert!(options.validate().is_ok(), "{valid} should be accepted");
        }
        for invalid in ["bogus=1", "host"] {
            let options = parse(&["--cluster-name", "c", "--agent-identifiers", invalid]);
            assert!(
                matches!(
                    options.validate(),
                    Err(AgentError::Validation { ref field, .. }) if field == "agent-identifiers"
                ),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn test_server_address_defaults_port() {
        let options = parse(&["--cluster-name", "c", "--tunnelserver-addr", "tunnel.example.com"]);
        let addr = options.server_addr().expect("valid").expect("set");
        assert_eq!(addr.host, "tunnel.example.com");
        assert_eq!(addr.port, AGENT_PORT);

        let options = parse(&["--cluster-name", "c", "--tunnelserver-addr", "10.0.0.1:9443"]);
        assert_eq!(options.server_addr().expect("valid").expect("set").port, 9443);

        assert!(parse(&["--cluster-name", "c"]).server_addr().expect("valid").is_none());
    }
}
