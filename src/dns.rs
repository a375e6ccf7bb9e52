use crate::address::Address;
use crate::error::{ProxyError, Result};
use log::{debug, warn};
use std::net::{IpAddr, SocketAddr};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

/// DNS resolver used by outbound handlers to turn destinations into socket addresses
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Create a new DNS resolver with default configuration
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), ResolverOpts::default())
    }

    /// Create a new DNS resolver with custom configuration
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver = TokioAsyncResolver::tokio(config, opts);

        Self { resolver }
    }

    /// Resolve a destination address. IP literals are returned as-is.
    pub async fn resolve(&self, address: &Address, port: u16, prefer_ipv4: bool) -> Result<SocketAddr> {
        match address {
            Address::Domain(domain) if prefer_ipv4 => match self.resolve_domain_v4(domain, port).await {
                Ok(addr) => Ok(addr),
                Err(_) => self.resolve_domain(domain, port).await,
            },
            Address::Domain(domain) => self.resolve_domain(domain, port).await,
            ip => ip.to_socket_addr(port),
        }
    }

    /// Resolve a domain name to an IP address
    pub async fn resolve_domain(&self, domain: &str, port: u16) -> Result<SocketAddr> {
        debug!("Resolving domain: {}:{}", domain, port);

        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => match lookup.iter().next() {
                Some(ip) => {
                    debug!("Resolved {} to IP: {}", domain, ip);
                    Ok(SocketAddr::new(ip, port))
                }
                None => Err(ProxyError::DnsResolution(format!("No IP addresses found for {}", domain))),
            },
            Err(e) => {
                warn!("DNS resolution failed for {}: {}", domain, e);
                Err(ProxyError::DnsResolution(e.to_string()))
            }
        }
    }

    /// Resolve a domain name to IPv4 address only
    pub async fn resolve_domain_v4(&self, domain: &str, port: u16) -> Result<SocketAddr> {
        debug!("Resolving domain to IPv4: {}:{}", domain, port);

        match self.resolver.ipv4_lookup(domain).await {
            Ok(lookup) => match lookup.iter().next() {
                Some(ipv4) => {
                    debug!("Resolved {} to IPv4: {}", domain, ipv4);
                    Ok(SocketAddr::new(IpAddr::V4(**ipv4), port))
                }
                None => Err(ProxyError::DnsResolution(format!("No IPv4 addresses found for {}", domain))),
            },
            Err(e) => {
                debug!("IPv4 resolution failed for {}: {}", domain, e);
                Err(ProxyError::DnsResolution(e.to_string()))
            }
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
