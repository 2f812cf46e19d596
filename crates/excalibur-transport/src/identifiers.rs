//! Agent identifiers
//!
//! An agent advertises which destinations it can reach as a comma separated
//! list of `type=value` entries, for example `host=cluster-a,cidr=10.0.0.0/8`.
//! The hub routes a dial to the agent whose identifiers match the
//! destination host.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Kind of destination an identifier describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    /// Hostname, usually the cluster name
    Host,
    /// IP network
    Cidr,
    /// Single IPv4 address
    Ipv4,
    /// Single IPv6 address
    Ipv6,
    /// Opaque unique id
    Uid,
}

impl IdentifierType {
    /// Key used in the textual form
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Cidr => "cidr",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Uid => "uid",
        }
    }
}

impl FromStr for IdentifierType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "cidr" => Ok(Self::Cidr),
            "ipv4" => Ok(Self::Ipv4),
            "ipv6" => Ok(Self::Ipv6),
            "uid" => Ok(Self::Uid),
            other => Err(TransportError::invalid_identifier(
                other,
                "unknown identifier type",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Identifier {
    Host(String),
    Cidr(IpNet),
    Ip(IpAddr),
    Uid(String),
}

impl Identifier {
    fn kind(&self) -> IdentifierType {
        match self {
            Self::Host(_) => IdentifierType::Host,
            Self::Cidr(_) => IdentifierType::Cidr,
            Self::Ip(IpAddr::V4(_)) => IdentifierType::Ipv4,
            Self::Ip(IpAddr::V6(_)) => IdentifierType::Ipv6,
            Self::Uid(_) => IdentifierType::Uid,
        }
    }

    fn parse(entry: &str) -> Result<Self, TransportError> {
        let mut parts = entry.split('=');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TransportError::invalid_identifier(
                entry,
                "expected exactly one '='",
            ));
        };
        let kind: IdentifierType = key
            .trim()
            .parse()
            .map_err(|_| TransportError::invalid_identifier(entry, "unknown identifier type"))?;
        let value = value.trim();
        let invalid = |reason: String| TransportError::invalid_identifier(entry, reason);

        match kind {
            IdentifierType::Host | IdentifierType::Uid if value.is_empty() => {
                Err(invalid("value must not be empty".to_string()))
            }
            IdentifierType::Host => Ok(Self::Host(value.to_string())),
            IdentifierType::Uid => Ok(Self::Uid(value.to_string())),
            IdentifierType::Cidr => value
                .parse::<IpNet>()
                .map(Self::Cidr)
                .map_err(|e| invalid(format!("invalid network: {}", e))),
            IdentifierType::Ipv4 => match value.parse::<IpAddr>() {
                Ok(ip @ IpAddr::V4(_)) => Ok(Self::Ip(ip)),
                _ => Err(invalid(format!("{:?} is not an IPv4 address", value))),
            },
            IdentifierType::Ipv6 => match value.parse::<IpAddr>() {
                Ok(ip @ IpAddr::V6(_)) => Ok(Self::Ip(ip)),
                _ => Err(invalid(format!("{:?} is not an IPv6 address", value))),
            },
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind().as_str();
        match self {
            Self::Host(v) | Self::Uid(v) => write!(f, "{}={}", kind, v),
            Self::Cidr(net) => write!(f, "{}={}", kind, net),
            Self::Ip(ip) => write!(f, "{}={}", kind, ip),
        }
    }
}

/// Parsed set of agent identifiers
///
/// The empty string parses to an empty set, which matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentifiers {
    entries: Vec<Identifier>,
}

impl AgentIdentifiers {
    /// Parse the comma separated textual form
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries = input
            .split(',')
            .map(|entry| Identifier::parse(entry.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Whether no identifiers were given
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of identifiers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Values of the `host` identifiers
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            Identifier::Host(h) => Some(h.as_str()),
            _ => None,
        })
    }

    /// Whether a dial to `host` should be served by this agent
    ///
    /// Hostnames compare case-insensitively against `host` entries. IP
    /// literals match `ipv4`/`ipv6` entries exactly and `cidr` entries by
    /// containment.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse::<IpAddr>().ok();
        self.entries.iter().any(|entry| match (entry, ip) {
            (Identifier::Host(h), _) => h.eq_ignore_ascii_case(host),
            (Identifier::Ip(addr), Some(ip)) => *addr == ip,
            (Identifier::Cidr(net), Some(ip)) => net.contains(&ip),
            _ => false,
        })
    }
}

impl FromStr for AgentIdentifiers {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AgentIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_documented_identifier_forms() {
        assert!(AgentIdentifiers::parse("").expect("empty").is_empty());
        assert_eq!(AgentIdentifiers::parse("host=cluster-a").expect("host").len(), 1);
        assert_eq!(
            AgentIdentifiers::parse("host=cluster-a,cidr=10.0.0.0/8")
                .expect("host and cidr")
                .len(),
            2
        );
        assert!(AgentIdentifiers::parse("bogus=1").is_err());
        assert!(AgentIdentifiers::parse("host").is_err());
    }

    #[test]
    fn test_values_are_checked_per_type() {
        for valid in [
            "ipv4=10.1.2.3",
            "ipv6=fd00::1",
            "cidr=fd00::/64",
            "uid=1b4e28ba",
            " host = cluster-a , uid=x ",
            "host=a,host=a",
        ] {
            assert!(AgentIdentifiers::parse(valid).is_ok(), "{} should parse", valid);
        }

        for invalid in [
            "ipv4=fd00::1",
            "ipv6=10.1.2.3",
            "cidr=10.0.0.0",
            "cidr=10.0.0.0/33",
            "cidr=not-an-ip/8",
            "host=",
            "uid=",
            "host=a=b",
            "host=a,",
            ",host=a",
        ] {
            assert!(AgentIdentifiers::parse(invalid).is_err(), "{} should fail", invalid);
        }
    }

    #[test]
    fn test_matching_by_host_and_address() {
        let ids = AgentIdentifiers::parse("host=Cluster-A,cidr=10.0.0.0/8,ipv6=fd00::1")
            .expect("parse");

        assert!(ids.matches("cluster-a"));
        assert!(ids.matches("10.200.3.4"));
        assert!(ids.matches("[fd00::1]"));
        assert!(!ids.matches("cluster-b"));
        assert!(!ids.matches("11.0.0.1"));
        assert!(!ids.matches("fd00::2"));
        assert!(!AgentIdentifiers::default().matches("cluster-a"));
    }

    #[test]
    fn test_zero_prefix_contains_everything_in_family() {
        let ids = AgentIdentifiers::parse("cidr=0.0.0.0/0").expect("parse");
        assert!(ids.matches("192.168.1.1"));
        assert!(!ids.matches("::1"));
        assert!(!ids.matches("cluster-a"));
    }

    #[test]
    fn test_cidr_matching_ignores_host_bits() {
        let ids = AgentIdentifiers::parse("cidr=10.1.2.3/16,cidr=fd00::5/120").expect("parse");
        assert!(ids.matches("10.1.200.1"));
        assert!(!ids.matches("10.2.0.1"));
        assert!(ids.matches("[fd00::ff]"));
        assert!(!ids.matches("fd00::100"));
    }

    #[test]
    fn test_display_is_canonical() {
        let ids = AgentIdentifiers::parse(" host=a , cidr=10.0.0.0/8").expect("parse");
        assert_eq!(ids.to_string(), "host=a,cidr=10.0.0.0/8");
        assert_eq!(ids.hosts().collect::<Vec<_>>(), vec!["a"]);
    }
}
