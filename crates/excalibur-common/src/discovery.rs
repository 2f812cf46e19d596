//! Tunnel server address discovery
//!
//! The tunnel server is fronted by the `x-tunnel-server-svc` service. Agents
//! dial the address derived from it, and the server requests a certificate
//! whose SANs cover every name the agents may dial.

use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use tracing::debug;

use crate::{Error, EXTERNAL_ADDR_ANNOTATION, TUNNEL_SERVER_PORT_NAME, TUNNEL_SERVER_SERVICE};

/// Network address of the tunnel server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelServerAddress {
    /// DNS name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl TunnelServerAddress {
    /// Parse `host:port`, `[v6]:port` or a bare host with `default_port`
    pub fn parse(input: &str, default_port: Option<u16>) -> Result<Self, String> {
        let (host, port) = split_host_port(input)?;
        let port = port
            .or(default_port)
            .ok_or_else(|| format!("address {} has no port", input))?;
        Ok(Self { host, port })
    }

    /// Host as an IP, if it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for TunnelServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Subject alternative names the tunnel server certificate must carry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSans {
    /// DNS SANs, deduplicated, in discovery order
    pub dns_names: Vec<String>,
    /// IP SANs, deduplicated, in discovery order
    pub ip_addresses: Vec<IpAddr>,
}

impl ServerSans {
    /// Add a host, routing IP literals to the IP list
    pub fn push_host(&mut self, host: &str) {
        let host = host.trim();
        if host.is_empty() {
            return;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => self.push_ip(ip),
            Err(_) => {
                if !self.dns_names.iter().any(|d| d == host) {
                    self.dns_names.push(host.to_string());
                }
            }
        }
    }

    /// Add an IP SAN
    pub fn push_ip(&mut self, ip: IpAddr) {
        if !self.ip_addresses.contains(&ip) {
            self.ip_addresses.push(ip);
        }
    }
}

fn split_host_port(input: &str) -> Result<(String, Option<u16>), String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty address".to_string());
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in {}", input))?;
        let port = match tail {
            "" => None,
            _ => Some(parse_port(
                tail.strip_prefix(':')
                    .ok_or_else(|| format!("malformed address {}", input))?,
            )?),
        };
        return Ok((host.to_string(), port));
    }

    // Bare IPv6 literals contain colons but no port
    if input.parse::<IpAddr>().is_ok() {
        return Ok((input.to_string(), None));
    }

    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
        Some(_) => Err(format!("malformed address {}", input)),
        None => Ok((input.to_string(), None)),
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("invalid port {}", port))
}

fn tunnel_port(svc: &Service) -> Option<u16> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(TUNNEL_SERVER_PORT_NAME))
        .and_then(|p| u16::try_from(p.port).ok())
}

fn external_annotation(svc: &Service) -> Option<&str> {
    svc.metadata
        .annotations
        .as_ref()?
        .get(EXTERNAL_ADDR_ANNOTATION)
        .map(String::as_str)
        .filter(|a| !a.trim().is_empty())
}

fn load_balancer_hosts(svc: &Service) -> Vec<String> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn cluster_ips(svc: &Service) -> Vec<String> {
    let Some(spec) = svc.spec.as_ref() else {
        return Vec::new();
    };
    let mut ips: Vec<String> = spec.cluster_ips.clone().unwrap_or_default();
    if let Some(ip) = &spec.cluster_ip {
        if !ips.contains(ip) {
            ips.insert(0, ip.clone());
        }
    }
    ips.retain(|ip| !ip.is_empty() && ip != "None");
    ips
}

/// Derive the address agents should dial from the tunnel server service
///
/// Preference: external address annotation, then the first load balancer
/// ingress, then the cluster IP. The `tcp` port fills in missing ports.
pub fn address_from_service(svc: &Service) -> Result<TunnelServerAddress, String> {
    let port = tunnel_port(svc);

    if let Some(external) = external_annotation(svc) {
        return TunnelServerAddress::parse(external, port);
    }

    let port = port.ok_or_else(|| format!("service has no port named {}", TUNNEL_SERVER_PORT_NAME))?;

    if let Some(host) = load_balancer_hosts(svc).into_iter().next() {
        return Ok(TunnelServerAddress { host, port });
    }

    cluster_ips(svc)
        .into_iter()
        .next()
        .map(|host| TunnelServerAddress { host, port })
        .ok_or_else(|| "service has neither load balancer ingress nor cluster IP".to_string())
}

/// Every name the tunnel server may be reached by through its service
pub fn sans_from_service(svc: &Service, namespace: &str) -> ServerSans {
    let mut sans = ServerSans::default();
    let name = svc
        .metadata
        .name
        .as_deref()
        .unwrap_or(TUNNEL_SERVER_SERVICE);

    sans.push_host(name);
    sans.push_host(&format!("{}.{}", name, namespace));
    sans.push_host(&format!("{}.{}.svc", name, namespace));
    sans.push_host(&format!("{}.{}.svc.cluster.local", name, namespace));

    if let Some(external) = external_annotation(svc) {
        if let Ok((host, _)) = split_host_port(external) {
            sans.push_host(&host);
        }
    }
    for host in load_balancer_hosts(svc) {
        sans.push_host(&host);
    }
    for ip in cluster_ips(svc) {
        sans.push_host(&ip);
    }
    sans
}

async fn fetch_service(client: &Client, namespace: &str) -> Result<Service, Error> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    api.get(TUNNEL_SERVER_SERVICE).await.map_err(|e| {
        Error::discovery(
            namespace,
            TUNNEL_SERVER_SERVICE,
            format!("failed to get service: {}", e),
        )
    })
}

/// Look up the tunnel server address through the API server
pub async fn get_tunnel_server_addr(
    client: &Client,
    namespace: &str,
) -> Result<TunnelServerAddress, Error> {
    let svc = fetch_service(client, namespace).await?;
    let addr = address_from_service(&svc)
        .map_err(|msg| Error::discovery(namespace, TUNNEL_SERVER_SERVICE, msg))?;
    debug!(address = %addr, "Discovered tunnel server address");
    Ok(addr)
}

/// Look up the tunnel server SANs through the API server
pub async fn get_tunnel_server_sans(client: &Client, namespace: &str) -> Result<ServerSans, Error> {
    let svc = fetch_service(client, namespace).await?;
    Ok(sans_from_service(&svc, namespace))
}
