use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Parses an IP literal, falling back to a domain name.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.into(),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    pub fn to_socket_addr(&self, port: u16) -> Result<SocketAddr> {
        match self {
            Address::V4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), port)),
            Address::V6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), port)),
            Address::Domain(_) => Err(ProxyError::Protocol("Domain resolution requires async context".to_string())),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::V4(ip),
            IpAddr::V6(ip) => Address::V6(ip),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => write!(f, "{}", ip),
            Address::V6(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => f.write_str(domain),
        }
    }
}

/// Transport kind of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Where an outbound handler should connect for one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    pub fn new(address: Address, port: u16, network: Network) -> Self {
        Self { address, port, network }
    }

    pub fn tcp(address: Address, port: u16) -> Self {
        Self::new(address, port, Network::Tcp)
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self::new(address, port, Network::Udp)
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(addr.ip().into(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(Address::parse("127.0.0.1"), Address::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(Address::parse("::1"), Address::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(Address::parse("example"), Address::Domain("example".to_string()));
    }

    #[test]
    fn test_destination_display() {
        let dest = Destination::tcp(Address::parse("example"), 80);
        assert_eq!(dest.to_string(), "example:80");
        assert_eq!(dest.network, Network::Tcp);

        let dest = Destination::tcp(Address::V6(Ipv6Addr::LOCALHOST), 443);
        assert_eq!(dest.to_string(), "[::1]:443");
    }

    #[test]
    fn test_domain_needs_resolution() {
        let addr = Address::Domain("example".to_string());
        assert!(addr.to_socket_addr(80).is_err());
        let addr = Address::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addr.to_socket_addr(80).unwrap(), "10.0.0.1:80".parse().unwrap());
    }
}
