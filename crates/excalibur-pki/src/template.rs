//! Identity templates
//!
//! A template is the subject and SANs one role asks the signing authority
//! for. Templates are rebuilt for every signing attempt, so address changes
//! are picked up on rotation.

use std::net::IpAddr;
use std::sync::Arc;

use excalibur_common::discovery::ServerSans;
use excalibur_common::{MASTER_ORG, SERVER_COMMON_NAME, TUNNEL_CSR_ORG};
use rcgen::{string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType};

use crate::{PkiError, Result};

/// OID 2.5.4.10 (organizationName), used for the second organization
const ORGANIZATION_OID: &[u64] = &[2, 5, 4, 10];

/// Produces a fresh template for each signing attempt
pub type TemplateFn = Arc<dyn Fn() -> Result<IdentityTemplate> + Send + Sync>;

/// What a certificate will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateRole {
    /// Tunnel server: serves agents and master clients, and is a client of the API server
    Server,
    /// Tunnel agent: client of the tunnel server
    Agent,
}

impl CertificateRole {
    /// Key usages requested from the signer
    pub fn usages(self) -> Vec<String> {
        let mut usages = vec![
            "digital signature".to_string(),
            "key encipherment".to_string(),
            "client auth".to_string(),
        ];
        if self == CertificateRole::Server {
            usages.push("server auth".to_string());
        }
        usages
    }

    /// Component name, used for the on-disk store location
    pub fn component(self) -> &'static str {
        match self {
            CertificateRole::Server => "excalibur-tunnel-server",
            CertificateRole::Agent => "excalibur-tunnel-agent",
        }
    }
}

/// Identity requested in a signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTemplate {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations, in order, without duplicates
    pub organizations: Vec<String>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
}

impl IdentityTemplate {
    /// Identity of the tunnel server
    ///
    /// Discovered SANs come first, followed by operator overrides.
    pub fn server(discovered: &ServerSans, extra_dns: &[String], extra_ips: &[IpAddr]) -> Self {
        let mut sans = discovered.clone();
        for name in extra_dns {
            sans.push_host(name);
        }
        for ip in extra_ips {
            sans.push_ip(*ip);
        }
        Self {
            common_name: SERVER_COMMON_NAME.to_string(),
            organizations: vec![MASTER_ORG.to_string(), TUNNEL_CSR_ORG.to_string()],
            dns_names: sans.dns_names,
            ip_addresses: sans.ip_addresses,
        }
    }

    /// Identity of an agent for `cluster_name` running at `pod_ip`
    pub fn agent(cluster_name: &str, pod_ip: IpAddr) -> Self {
        Self {
            common_name: cluster_name.to_string(),
            organizations: vec![TUNNEL_CSR_ORG.to_string()],
            dns_names: vec![cluster_name.to_string()],
            ip_addresses: vec![pod_ip],
        }
    }

    /// Role implied by the organizations
    pub fn role(&self) -> CertificateRole {
        if self.organizations.iter().any(|o| o == MASTER_ORG) {
            CertificateRole::Server
        } else {
            CertificateRole::Agent
        }
    }

    /// Build a PEM-encoded PKCS#10 request signed by `key`
    pub fn to_csr_pem(&self, key: &KeyPair) -> Result<String> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name()?;

        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for name in &self.dns_names {
            let dns = Ia5String::try_from(name.as_str())
                .map_err(|e| PkiError::InvalidCsr(format!("invalid DNS name {}: {}", name, e)))?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        let csr = params
            .serialize_request(key)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to create CSR: {}", e)))?;
        csr.pem()
            .map_err(|e| PkiError::InvalidCsr(format!("failed to serialize CSR: {}", e)))
    }

    fn distinguished_name(&self) -> Result<DistinguishedName> {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.common_name.clone()),
        );

        // rcgen keys the DN by attribute type, so a second organization is
        // written under its raw OID to keep both RDNs.
        match self.organizations.as_slice() {
            [] => {}
            [org] => dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone())),
            [first, second] => {
                dn.push(DnType::OrganizationName, DnValue::Utf8String(first.clone()));
                dn.push(
                    DnType::CustomDnType(ORGANIZATION_OID.to_vec()),
                    DnValue::Utf8String(second.clone()),
                );
            }
            more => {
                return Err(PkiError::InvalidCsr(format!(
                    "at most two organizations are supported, got {}",
                    more.len()
                )))
            }
        }
        Ok(dn)
    }
}

/// Generate a fresh key pair for a signing attempt
pub fn generate_key() -> Result<KeyPair> {
    KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn parse_csr_orgs(csr_pem: &str) -> (String, Vec<String>) {
        let block = ::pem::parse(csr_pem).expect("CSR PEM");
        assert_eq!(block.tag(), "CERTIFICATE REQUEST");
        let (_, csr) =
            X509CertificationRequest::from_der(block.contents()).expect("CSR should parse");
        let subject = &csr.certification_request_info.subject;
        let cn = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let orgs = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok().map(str::to_string))
            .collect();
        (cn, orgs)
    }

    #[test]
    fn story_agent_requests_tunnel_scoped_identity() {
        let template = IdentityTemplate::agent("cluster-a", "10.1.2.3".parse().expect("ip"));
        assert_eq!(template.common_name, "cluster-a");
        assert_eq!(template.organizations, vec![TUNNEL_CSR_ORG]);
        assert_eq!(template.dns_names, vec!["cluster-a"]);
        assert_eq!(template.role(), CertificateRole::Agent);

        let key = generate_key().expect("key");
        let csr = template.to_csr_pem(&key).expect("csr");
        let (cn, orgs) = parse_csr_orgs(&csr);
        assert_eq!(cn, "cluster-a");
        assert_eq!(orgs, vec![TUNNEL_CSR_ORG]);
    }

    #[test]
    fn story_server_requests_master_and_tunnel_orgs() {
        let mut discovered = ServerSans::default();
        discovered.push_host("x-tunnel-server-svc.kube-system.svc");
        discovered.push_host("10.96.0.20");

        let template = IdentityTemplate::server(
            &discovered,
            &["tunnel.example.com".to_string(), "x-tunnel-server-svc.kube-system.svc".to_string()],
            &["203.0.113.7".parse().expect("ip")],
        );
        assert_eq!(template.common_name, SERVER_COMMON_NAME);
        assert_eq!(template.role(), CertificateRole::Server);
        assert_eq!(
            template.dns_names,
            vec!["x-tunnel-server-svc.kube-system.svc", "tunnel.example.com"]
        );
        assert_eq!(template.ip_addresses.len(), 2);

        let key = generate_key().expect("key");
        let csr = template.to_csr_pem(&key).expect("csr");
        let (cn, orgs) = parse_csr_orgs(&csr);
        assert_eq!(cn, SERVER_COMMON_NAME);
        assert_eq!(orgs, vec![MASTER_ORG, TUNNEL_CSR_ORG]);
    }

    #[test]
    fn test_private_key_never_in_csr() {
        let template = IdentityTemplate::agent("cluster-a", "10.1.2.3".parse().expect("ip"));
        let key = generate_key().expect("key");
        let csr = template.to_csr_pem(&key).expect("csr");
        assert!(!csr.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_too_many_organizations_rejected() {
        let mut template = IdentityTemplate::agent("cluster-a", "10.1.2.3".parse().expect("ip"));
        template.organizations = vec!["a".into(), "b".into(), "c".into()];
        let key = generate_key().expect("key");
        assert!(matches!(
            template.to_csr_pem(&key),
            Err(PkiError::InvalidCsr(_))
        ));
    }

    #[test]
    fn test_role_usages() {
        assert!(!CertificateRole::Agent
            .usages()
            .contains(&"server auth".to_string()));
        assert!(CertificateRole::Server
            .usages()
            .contains(&"server auth".to_string()));
        assert!(CertificateRole::Server
            .usages()
            .contains(&"client auth".to_string()));
    }
}
